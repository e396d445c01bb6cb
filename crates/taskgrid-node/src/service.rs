//! Completion protocol client: the node's outbound path to the coordinator.
//!
//! Completion notifications are fire-and-forget: the handle that finished
//! never waits on the coordinator, and a lost notification is logged rather
//! than retried. The coordinator matches notifications by allocation id, so
//! a duplicate delivery of the same notification is harmless.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use taskgrid_state::{AllocationId, PersistentTask, TaskFailure};

use crate::error::{CompletionError, NodeResult};
use crate::task_manager::{LocalTaskId, TaskManager};

/// Boxed future returned by [`CoordinatorClient::complete_persistent_task`].
pub type CompletionFuture =
    Pin<Box<dyn Future<Output = Result<PersistentTask, CompletionError>> + Send>>;

/// Transport to the coordinator's completion handler.
pub trait CoordinatorClient: Send + Sync {
    /// Report that the attempt `allocation_id` of `task_id` finished.
    ///
    /// `failure` describes a failed attempt and whether it may be retried.
    /// The returned future resolves to the coordinator's view of the task
    /// after it processed the notification.
    fn complete_persistent_task(
        &self,
        task_id: &str,
        allocation_id: AllocationId,
        failure: Option<TaskFailure>,
    ) -> CompletionFuture;
}

/// Sends completion notifications and local cancellations for this node.
pub struct PersistentTasksService {
    client: Arc<dyn CoordinatorClient>,
    task_manager: Arc<TaskManager>,
}

impl PersistentTasksService {
    pub fn new(client: Arc<dyn CoordinatorClient>, task_manager: Arc<TaskManager>) -> Self {
        Self {
            client,
            task_manager,
        }
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// Notify the coordinator without waiting for the outcome.
    ///
    /// The request is spawned onto the current tokio runtime; outside a
    /// runtime it is dropped with a warning.
    pub fn notify_completion(
        &self,
        task_id: &str,
        allocation_id: AllocationId,
        failure: Option<TaskFailure>,
    ) {
        let request = self
            .client
            .complete_persistent_task(task_id, allocation_id, failure);

        let Ok(runtime) = Handle::try_current() else {
            warn!(%task_id, allocation_id, "no runtime available, completion notification dropped");
            return;
        };

        let task_id = task_id.to_string();
        runtime.spawn(async move {
            match request.await {
                Ok(task) => {
                    debug!(
                        %task_id,
                        allocation_id,
                        next_allocation_id = task.allocation_id,
                        "coordinator acknowledged completion"
                    );
                }
                Err(CompletionError::NotFound(_)) => {
                    // The coordinator already dropped this attempt.
                    debug!(%task_id, allocation_id, "completion for unknown task ignored by coordinator");
                }
                Err(e) => {
                    warn!(%task_id, allocation_id, error = %e, "failed to notify coordinator of completion");
                }
            }
        });
    }

    /// Notify the coordinator and wait for its answer.
    pub async fn complete(
        &self,
        task_id: &str,
        allocation_id: AllocationId,
        failure: Option<TaskFailure>,
    ) -> Result<PersistentTask, CompletionError> {
        self.client
            .complete_persistent_task(task_id, allocation_id, failure)
            .await
    }

    /// Cancel a locally running task through the task manager.
    ///
    /// Used when the coordinator has already dropped the assignment, so no
    /// coordinator round-trip is involved.
    pub fn send_task_manager_cancellation(&self, id: LocalTaskId, reason: &str) -> NodeResult<()> {
        self.task_manager.cancel(id, reason)
    }

    /// Remove a finished task from the task manager.
    pub fn unregister(&self, id: LocalTaskId) -> bool {
        self.task_manager.unregister(id)
    }
}
