//! Cluster-changed events: the unit of input for node reconciliation.

use std::sync::Arc;

use crate::types::ClusterState;

/// A transition between two consecutive cluster-state snapshots.
///
/// Both snapshots are shared by reference; building an event never copies
/// the task table.
#[derive(Debug, Clone)]
pub struct ClusterChangedEvent {
    previous: Arc<ClusterState>,
    state: Arc<ClusterState>,
    nodes_changed: bool,
}

impl ClusterChangedEvent {
    /// Pair two snapshots. Membership change is derived from the node sets.
    pub fn new(previous: Arc<ClusterState>, state: Arc<ClusterState>) -> Self {
        let nodes_changed = previous.nodes != state.nodes;
        Self {
            previous,
            state,
            nodes_changed,
        }
    }

    pub fn previous_state(&self) -> &Arc<ClusterState> {
        &self.previous
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    /// Whether node membership differs between the two snapshots.
    pub fn nodes_changed(&self) -> bool {
        self.nodes_changed
    }

    /// Whether the task tables differ. Shared tables short-circuit to `false`.
    pub fn tasks_changed(&self) -> bool {
        !(Arc::ptr_eq(&self.previous.tasks, &self.state.tasks)
            || self.previous.tasks == self.state.tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PersistentTasks;
    use serde_json::json;

    fn state_with(nodes: &[&str], tasks: Arc<PersistentTasks>) -> Arc<ClusterState> {
        Arc::new(ClusterState {
            version: 1,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            tasks,
        })
    }

    #[test]
    fn same_snapshot_is_unchanged() {
        let state = state_with(&["node-1"], Arc::new(PersistentTasks::new()));
        let event = ClusterChangedEvent::new(state.clone(), state);
        assert!(!event.tasks_changed());
        assert!(!event.nodes_changed());
    }

    #[test]
    fn shared_task_table_with_new_member() {
        let tasks = Arc::new(PersistentTasks::new());
        let before = state_with(&["node-1"], tasks.clone());
        let after = state_with(&["node-1", "node-2"], tasks);
        let event = ClusterChangedEvent::new(before, after);
        assert!(!event.tasks_changed());
        assert!(event.nodes_changed());
    }

    #[test]
    fn equal_but_distinct_tables_are_unchanged() {
        let before = state_with(&["node-1"], Arc::new(PersistentTasks::new()));
        let after = state_with(&["node-1"], Arc::new(PersistentTasks::new()));
        assert!(!ClusterChangedEvent::new(before, after).tasks_changed());
    }

    #[test]
    fn added_task_is_a_change() {
        let before = state_with(&["node-1"], Arc::new(PersistentTasks::new()));
        let mut tasks = PersistentTasks::new();
        tasks
            .add("t1", "sleep", json!({}), Some("node-1".into()), 0)
            .unwrap();
        let after = state_with(&["node-1"], Arc::new(tasks));
        assert!(ClusterChangedEvent::new(before, after).tasks_changed());
    }
}
