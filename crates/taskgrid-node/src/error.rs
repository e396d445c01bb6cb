//! Node error types.

use thiserror::Error;

use crate::task_manager::LocalTaskId;

/// Errors raised by the node-side task machinery.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no executor registered for task type: {0}")]
    UnknownTaskType(String),

    #[error("task execution unavailable: {0}")]
    ExecutionUnavailable(String),

    #[error("local task not found: {0}")]
    TaskNotFound(LocalTaskId),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Outcome of a completion notification the coordinator did not accept.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    /// The task (or this allocation of it) is no longer in the cluster state.
    #[error("persistent task not found: {0}")]
    NotFound(String),

    /// The coordinator rejected the request as malformed.
    #[error("invalid completion request: {0}")]
    Invalid(String),

    /// The request never reached the coordinator or it could not process it.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}
