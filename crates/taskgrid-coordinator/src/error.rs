//! Coordinator error types.

use thiserror::Error;

/// Errors that can occur while mutating the cluster state.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Malformed request, e.g. a missing task id.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown task id, or a request for an allocation that is no longer current.
    #[error("persistent task not found: {0}")]
    TaskNotFound(String),

    #[error("persistent task already exists: {0}")]
    TaskAlreadyExists(String),

    #[error("state store error: {0}")]
    State(#[from] taskgrid_state::StateError),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
