//! Executor lookup and hand-off.
//!
//! Task types are resolved to [`PersistentTasksExecutor`] capability
//! objects through an [`ExecutorRegistry`]; an unknown type is a typed
//! error, not a panic. [`NodeTaskExecutor`] hands resolved logic to the
//! tokio runtime and turns its outcome (including a panic) into the
//! handle's completion.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error};

use crate::error::{NodeError, NodeResult};
use crate::task::AllocatedTask;

/// Boxed future running one task's logic.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// The logic behind one task type.
pub trait PersistentTasksExecutor: Send + Sync {
    /// Task-type name this executor is registered under.
    fn task_name(&self) -> &str;

    /// Run the task to completion.
    ///
    /// Implementations should watch [`AllocatedTask::cancelled`] and return
    /// soon after it resolves; the outcome of a cancelled task is never
    /// reported to the coordinator.
    fn node_operation(
        &self,
        task: Arc<AllocatedTask>,
        params: Arc<serde_json::Value>,
    ) -> TaskFuture;
}

/// Task-type name → executor.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn PersistentTasksExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for the same type.
    pub fn register(&mut self, executor: Arc<dyn PersistentTasksExecutor>) -> &mut Self {
        self.executors
            .insert(executor.task_name().to_string(), executor);
        self
    }

    /// Resolve the executor for `task_name`.
    pub fn get(&self, task_name: &str) -> NodeResult<Arc<dyn PersistentTasksExecutor>> {
        self.executors
            .get(task_name)
            .cloned()
            .ok_or_else(|| NodeError::UnknownTaskType(task_name.to_string()))
    }

    /// Registered task-type names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl FromIterator<Arc<dyn PersistentTasksExecutor>> for ExecutorRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<dyn PersistentTasksExecutor>>>(iter: I) -> Self {
        let mut registry = Self::new();
        for executor in iter {
            registry.register(executor);
        }
        registry
    }
}

/// Runs task logic on the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeTaskExecutor;

impl NodeTaskExecutor {
    /// Start `executor` for `task` in the background.
    ///
    /// Fails synchronously only when there is no runtime to hand the task
    /// to; everything after the hand-off is reported through the handle.
    pub fn execute_task(
        &self,
        params: Arc<serde_json::Value>,
        task: Arc<AllocatedTask>,
        executor: Arc<dyn PersistentTasksExecutor>,
    ) -> NodeResult<()> {
        let runtime =
            Handle::try_current().map_err(|e| NodeError::ExecutionUnavailable(e.to_string()))?;

        let operation = executor.node_operation(task.clone(), params);
        let logic = runtime.spawn(operation);
        runtime.spawn(async move {
            match logic.await {
                Ok(Ok(())) => task.mark_as_completed(),
                Ok(Err(e)) => {
                    debug!(
                        task_id = %task.persistent_task_id(),
                        allocation_id = task.allocation_id(),
                        error = %e,
                        "task logic returned an error"
                    );
                    task.mark_as_failed(format!("{e:#}"));
                }
                Err(e) => {
                    error!(
                        task_id = %task.persistent_task_id(),
                        allocation_id = task.allocation_id(),
                        error = %e,
                        "task logic panicked"
                    );
                    task.mark_as_failed(format!("task logic panicked: {e}"));
                }
            }
        });
        Ok(())
    }
}
