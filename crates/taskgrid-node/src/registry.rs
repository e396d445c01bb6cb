//! Allocation registry: what is actually allocated on this node.
//!
//! Maps allocation id → handle. An entry whose handle is COMPLETED is a
//! tombstone: the task is no longer registered with the task manager and
//! waits for the coordinator to drop the assignment. All membership
//! changes go through one mutex; state transitions are guarded by each
//! handle's own lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use taskgrid_state::{AllocationId, TaskId};

use crate::task::{AllocatedTask, TaskStatus};

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationStatus {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub task_name: String,
    pub status: TaskStatus,
}

/// Allocation id → allocated task handle.
#[derive(Default)]
pub struct AllocationRegistry {
    tasks: Mutex<HashMap<AllocationId, Arc<AllocatedTask>>>,
}

impl AllocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle under its allocation id.
    ///
    /// Returns false, leaving the existing entry in place, if the
    /// allocation id is already registered.
    pub fn insert(&self, task: Arc<AllocatedTask>) -> bool {
        let mut tasks = self.lock();
        if tasks.contains_key(&task.allocation_id()) {
            return false;
        }
        tasks.insert(task.allocation_id(), task);
        true
    }

    pub fn get(&self, allocation_id: AllocationId) -> Option<Arc<AllocatedTask>> {
        self.lock().get(&allocation_id).cloned()
    }

    pub fn contains(&self, allocation_id: AllocationId) -> bool {
        self.lock().contains_key(&allocation_id)
    }

    pub fn remove(&self, allocation_id: AllocationId) -> Option<Arc<AllocatedTask>> {
        self.lock().remove(&allocation_id)
    }

    /// All registered allocation ids.
    pub fn allocation_ids(&self) -> HashSet<AllocationId> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Status of every entry, ordered by allocation id.
    pub fn statuses(&self) -> Vec<AllocationStatus> {
        let mut statuses: Vec<AllocationStatus> = self
            .lock()
            .values()
            .map(|task| AllocationStatus {
                allocation_id: task.allocation_id(),
                task_id: task.persistent_task_id().to_string(),
                task_name: task.task_name().to_string(),
                status: task.status(),
            })
            .collect();
        statuses.sort_by_key(|s| s.allocation_id);
        statuses
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AllocationId, Arc<AllocatedTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use crate::testing::{RecordingClient, assigned, service};

    fn allocated(allocation_id: AllocationId) -> Arc<AllocatedTask> {
        let svc = service(RecordingClient::new());
        let reg = svc
            .task_manager()
            .register("persistent", "sleep[c]", String::new());
        let task = assigned(&format!("t{allocation_id}"), allocation_id, "sleep", "node-1");
        Arc::new(AllocatedTask::new(reg, &task, svc))
    }

    #[test]
    fn insert_refuses_duplicates() {
        let registry = AllocationRegistry::new();
        let first = allocated(1);
        assert!(registry.insert(first.clone()));
        assert!(!registry.insert(allocated(1)));
        assert!(Arc::ptr_eq(&registry.get(1).unwrap(), &first));
    }

    #[test]
    fn remove_returns_the_handle() {
        let registry = AllocationRegistry::new();
        registry.insert(allocated(1));
        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn statuses_are_ordered_and_reflect_state() {
        let registry = AllocationRegistry::new();
        let done = allocated(3);
        registry.insert(done.clone());
        registry.insert(allocated(1));
        done.mark_as_completed();

        let statuses = registry.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].allocation_id, 1);
        assert_eq!(statuses[0].status.state, TaskState::Started);
        assert_eq!(statuses[1].status.state, TaskState::Completed);
    }

    #[test]
    fn allocation_ids_snapshot() {
        let registry = AllocationRegistry::new();
        registry.insert(allocated(1));
        registry.insert(allocated(2));
        assert_eq!(registry.allocation_ids(), HashSet::from([1, 2]));
    }
}
