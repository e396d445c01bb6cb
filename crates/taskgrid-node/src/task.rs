//! Allocated task: the node-local handle for one assignment attempt.
//!
//! State machine:
//!
//! ```text
//! STARTED ──cancel──▶ PENDING_CANCEL ──finish──▶ COMPLETED (silent)
//!    │
//!    └──────────────finish───────────────────▶ COMPLETED (notifies coordinator)
//! ```
//!
//! COMPLETED is terminal. Every transition happens under the handle's lock
//! and reports whether it took effect, so the side effect attached to it
//! (cancellation signal, coordinator notification) runs at most once.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use taskgrid_state::{AllocationId, PersistentTask, TaskFailure, TaskId};

use crate::service::PersistentTasksService;
use crate::task_manager::{LocalTaskId, Registration};

/// Local lifecycle state of an allocated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Running; the coordinator is notified when it finishes.
    Started,
    /// Cancelled because the coordinator dropped the assignment.
    PendingCancel,
    /// Finished; kept as a tombstone until the coordinator drops the assignment.
    Completed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Started => "STARTED",
            TaskState::PendingCancel => "PENDING_CANCEL",
            TaskState::Completed => "COMPLETED",
        })
    }
}

/// Externally visible status of an allocated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
}

impl TaskStatus {
    /// Name the status is reported under.
    pub const NAME: &'static str = "persistent_executor";

    pub fn new(state: TaskState) -> Self {
        Self { state }
    }
}

/// Handle for one allocation of a persistent task running on this node.
pub struct AllocatedTask {
    id: LocalTaskId,
    allocation_id: AllocationId,
    persistent_task_id: TaskId,
    task_name: String,
    params: Arc<serde_json::Value>,
    state: Mutex<TaskState>,
    cancelled: watch::Receiver<bool>,
    service: Arc<PersistentTasksService>,
}

impl AllocatedTask {
    /// Build a handle in the STARTED state for a task-manager registration.
    pub fn new(
        registration: Registration,
        task: &PersistentTask,
        service: Arc<PersistentTasksService>,
    ) -> Self {
        Self {
            id: registration.id,
            allocation_id: task.allocation_id,
            persistent_task_id: task.id.clone(),
            task_name: task.task_name.clone(),
            params: Arc::new(task.params.clone()),
            state: Mutex::new(TaskState::Started),
            cancelled: registration.cancelled,
            service,
        }
    }

    /// Node-local task manager id.
    pub fn id(&self) -> LocalTaskId {
        self.id
    }

    pub fn allocation_id(&self) -> AllocationId {
        self.allocation_id
    }

    pub fn persistent_task_id(&self) -> &str {
        &self.persistent_task_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn params(&self) -> &Arc<serde_json::Value> {
        &self.params
    }

    pub fn state(&self) -> TaskState {
        *self.lock()
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::new(self.state())
    }

    /// Whether a cancellation signal has been delivered.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the task is cancelled.
    ///
    /// Task logic should select on this and return promptly.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Unregistered without a cancellation: never resolves.
            std::future::pending::<()>().await;
        }
    }

    /// STARTED → PENDING_CANCEL.
    ///
    /// Returns true only if this call made the transition; the caller then
    /// owns delivering the cancellation signal.
    pub fn mark_as_cancelled(&self) -> bool {
        let mut state = self.lock();
        if *state == TaskState::Started {
            *state = TaskState::PendingCancel;
            true
        } else {
            false
        }
    }

    /// Task logic finished successfully.
    pub fn mark_as_completed(&self) {
        self.finish(None);
    }

    /// Task logic failed. The coordinator may retry the task.
    pub fn mark_as_failed(&self, error: impl fmt::Display) {
        self.finish(Some(TaskFailure::runtime(error.to_string())));
    }

    /// The task cannot run on any node as configured. The coordinator
    /// drops it instead of retrying.
    pub fn mark_as_misconfigured(&self, error: impl fmt::Display) {
        self.finish(Some(TaskFailure::config(error.to_string())));
    }

    fn finish(&self, failure: Option<TaskFailure>) {
        let previous = {
            let mut state = self.lock();
            let previous = *state;
            if previous == TaskState::Completed {
                trace!(
                    task_id = %self.persistent_task_id,
                    allocation_id = self.allocation_id,
                    "task already completed"
                );
                return;
            }
            *state = TaskState::Completed;
            previous
        };

        self.service.unregister(self.id);

        if previous == TaskState::Started {
            match &failure {
                Some(failure) => warn!(
                    task_id = %self.persistent_task_id,
                    allocation_id = self.allocation_id,
                    kind = ?failure.kind,
                    error = %failure,
                    "persistent task failed"
                ),
                None => info!(
                    task_id = %self.persistent_task_id,
                    allocation_id = self.allocation_id,
                    "persistent task completed"
                ),
            }
            self.service
                .notify_completion(&self.persistent_task_id, self.allocation_id, failure);
        } else {
            debug!(
                task_id = %self.persistent_task_id,
                allocation_id = self.allocation_id,
                "cancelled task finished, coordinator not notified"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AllocatedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedTask")
            .field("id", &self.id)
            .field("allocation_id", &self.allocation_id)
            .field("persistent_task_id", &self.persistent_task_id)
            .field("task_name", &self.task_name)
            .field("state", &self.state())
            .finish()
    }
}
