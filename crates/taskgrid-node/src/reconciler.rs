//! Reconciler: converges the node's running tasks onto the cluster state.
//!
//! Each pass compares the assignments for this node in the new snapshot
//! with the allocation registry:
//!
//! ```text
//! cluster state   local state      action
//! assigned        absent           start (register + hand off)
//! assigned        STARTED          none, still running
//! assigned        COMPLETED        none, waiting for the coordinator
//! absent          STARTED          remove locally, PENDING_CANCEL, cancel
//! absent          PENDING_CANCEL   remove locally
//! absent          COMPLETED        remove the tombstone
//! ```
//!
//! A task that completes while it is being cancelled counts as purged: its
//! completion went to the coordinator and no cancellation was delivered.
//!
//! Passes are level-triggered: each one recomputes desired vs. actual from
//! the whole snapshot, so skipped intermediate snapshots do no harm. A pass
//! only registers and hands off work, it never waits on task logic.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use taskgrid_state::{AllocationId, ClusterChangedEvent, NodeId, PersistentTask};

use crate::error::NodeError;
use crate::executor::{ExecutorRegistry, NodeTaskExecutor};
use crate::registry::{AllocationRegistry, AllocationStatus};
use crate::service::PersistentTasksService;
use crate::task::{AllocatedTask, TaskState};

/// Task kind used when registering with the task manager.
const TASK_KIND: &str = "persistent";

/// What a reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: Vec<AllocationId>,
    /// Allocations moved to PENDING_CANCEL by this pass.
    pub cancelled: Vec<AllocationId>,
    /// Completed allocations dropped from the registry.
    pub purged: Vec<AllocationId>,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.cancelled.is_empty() && self.purged.is_empty()
    }
}

/// Per-node reconciliation engine.
pub struct Reconciler {
    node_id: NodeId,
    registry: AllocationRegistry,
    executors: Arc<ExecutorRegistry>,
    service: Arc<PersistentTasksService>,
    node_executor: NodeTaskExecutor,
}

impl Reconciler {
    pub fn new(
        node_id: impl Into<NodeId>,
        executors: Arc<ExecutorRegistry>,
        service: Arc<PersistentTasksService>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            registry: AllocationRegistry::new(),
            executors,
            service,
            node_executor: NodeTaskExecutor,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    /// Status of every local allocation, ordered by allocation id.
    pub fn statuses(&self) -> Vec<AllocationStatus> {
        self.registry.statuses()
    }

    /// Apply one cluster-state transition.
    ///
    /// Must not run concurrently with itself; [`crate::ClusterStateApplier`]
    /// provides that serialization.
    pub fn cluster_changed(&self, event: &ClusterChangedEvent) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        if !event.tasks_changed() && !event.nodes_changed() {
            return summary;
        }

        let tasks = &event.state().tasks;
        let mut not_visited: HashSet<AllocationId> = self.registry.allocation_ids();

        for task in tasks.assigned_to(&self.node_id) {
            if not_visited.remove(&task.allocation_id) || self.registry.contains(task.allocation_id)
            {
                continue;
            }
            if self.start_task(task) {
                summary.started.push(task.allocation_id);
            }
        }

        let mut leftovers: Vec<AllocationId> = not_visited.into_iter().collect();
        leftovers.sort_unstable();
        for allocation_id in leftovers {
            let Some(task) = self.registry.remove(allocation_id) else {
                continue;
            };
            if task.state() == TaskState::Completed {
                // The coordinator has absorbed the completion.
                trace!(node_id = %self.node_id, allocation_id, "tombstone removed");
                summary.purged.push(allocation_id);
                continue;
            }
            trace!(
                node_id = %self.node_id,
                allocation_id,
                task_id = %task.persistent_task_id(),
                "found unassigned local task, cancelling"
            );
            if self.cancel_task(&task) {
                summary.cancelled.push(allocation_id);
            } else {
                trace!(node_id = %self.node_id, allocation_id, "task completed before cancellation");
                summary.purged.push(allocation_id);
            }
        }

        if !summary.is_noop() {
            debug!(
                node_id = %self.node_id,
                version = event.state().version,
                started = summary.started.len(),
                cancelled = summary.cancelled.len(),
                purged = summary.purged.len(),
                "reconciled persistent tasks"
            );
        }
        summary
    }

    /// Register, record, and hand off a newly assigned task.
    ///
    /// Returns false if nothing was recorded for the allocation.
    fn start_task(&self, task: &PersistentTask) -> bool {
        let registration = self.service.task_manager().register(
            TASK_KIND,
            &format!("{}[c]", task.task_name),
            format!("id={}", task.id),
        );
        let local_id = registration.id;
        let handle = Arc::new(AllocatedTask::new(registration, task, self.service.clone()));

        if !self.registry.insert(handle.clone()) {
            self.service.unregister(local_id);
            warn!(
                node_id = %self.node_id,
                allocation_id = task.allocation_id,
                "allocation already registered, start skipped"
            );
            return false;
        }

        let handed_off = self.executors.get(&task.task_name).and_then(|executor| {
            self.node_executor
                .execute_task(handle.params().clone(), handle.clone(), executor)
        });
        // On error the handle stays as a tombstone and the failure goes out
        // through the normal completion path.
        match handed_off {
            Ok(()) => debug!(
                node_id = %self.node_id,
                task_id = %task.id,
                allocation_id = task.allocation_id,
                task_name = %task.task_name,
                "persistent task started"
            ),
            Err(e @ NodeError::UnknownTaskType(_)) => handle.mark_as_misconfigured(e),
            Err(e) => handle.mark_as_failed(e),
        }
        true
    }

    /// Cancel a task the coordinator no longer assigns here, without
    /// notifying the coordinator.
    ///
    /// Returns false if the task completed first.
    fn cancel_task(&self, task: &AllocatedTask) -> bool {
        let allocation_id = task.allocation_id();
        if !task.mark_as_cancelled() {
            return false;
        }
        match self
            .service
            .send_task_manager_cancellation(task.id(), "persistent task was unassigned")
        {
            Ok(()) => trace!(
                node_id = %self.node_id,
                task_id = %task.persistent_task_id(),
                allocation_id,
                "persistent task was cancelled"
            ),
            Err(e) => warn!(
                node_id = %self.node_id,
                task_id = %task.persistent_task_id(),
                allocation_id,
                error = %e,
                "failed to cancel task"
            ),
        }
        true
    }
}
