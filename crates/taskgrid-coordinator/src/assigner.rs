//! Placement of persistent tasks onto nodes.

use std::collections::{BTreeSet, HashMap};

use taskgrid_state::{NodeId, PersistentTask, PersistentTasks};

/// Decides which node executes a task.
///
/// Returning `None` leaves the task unassigned until membership changes.
pub trait Assigner: Send + Sync {
    fn assign(
        &self,
        task: &PersistentTask,
        nodes: &BTreeSet<NodeId>,
        tasks: &PersistentTasks,
    ) -> Option<NodeId>;
}

/// Picks the node running the fewest tasks; ties go to the lowest node id.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoadedAssigner;

impl Assigner for LeastLoadedAssigner {
    fn assign(
        &self,
        task: &PersistentTask,
        nodes: &BTreeSet<NodeId>,
        tasks: &PersistentTasks,
    ) -> Option<NodeId> {
        let mut load: HashMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();
        for other in tasks.tasks().filter(|t| t.id != task.id) {
            if let Some(count) = other
                .executor_node
                .as_deref()
                .and_then(|node| load.get_mut(node))
            {
                *count += 1;
            }
        }
        nodes
            .iter()
            .min_by_key(|&node| (load.get(node.as_str()).copied().unwrap_or(0), node))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str, allocation_id: u64, node: Option<&str>) -> PersistentTask {
        PersistentTask {
            id: id.to_string(),
            allocation_id,
            task_name: "sleep".to_string(),
            params: json!({}),
            executor_node: node.map(str::to_string),
            failures: 0,
            created_at: 0,
        }
    }

    fn nodes(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn no_nodes_means_no_assignment() {
        let tasks = PersistentTasks::new();
        assert_eq!(
            LeastLoadedAssigner.assign(&task("t1", 1, None), &BTreeSet::new(), &tasks),
            None
        );
    }

    #[test]
    fn ties_go_to_lowest_node_id() {
        let tasks = PersistentTasks::new();
        let chosen = LeastLoadedAssigner.assign(&task("t1", 1, None), &nodes(&["b", "a"]), &tasks);
        assert_eq!(chosen.as_deref(), Some("a"));
    }

    #[test]
    fn prefers_least_loaded_node() {
        let tasks = PersistentTasks::from_parts(
            0,
            vec![task("t1", 1, Some("a")), task("t2", 2, Some("a")), task("t3", 3, Some("b"))],
        );
        let chosen = LeastLoadedAssigner.assign(&task("t4", 4, None), &nodes(&["a", "b", "c"]), &tasks);
        assert_eq!(chosen.as_deref(), Some("c"));
    }

    #[test]
    fn task_does_not_count_against_its_current_node() {
        let tasks = PersistentTasks::from_parts(
            0,
            vec![task("t1", 1, Some("a")), task("t2", 2, Some("b"))],
        );
        let chosen = LeastLoadedAssigner.assign(&task("t1", 1, Some("a")), &nodes(&["a", "b"]), &tasks);
        assert_eq!(chosen.as_deref(), Some("a"));
    }

    #[test]
    fn departed_nodes_are_not_counted() {
        let tasks = PersistentTasks::from_parts(0, vec![task("t1", 1, Some("gone"))]);
        let chosen = LeastLoadedAssigner.assign(&task("t2", 2, None), &nodes(&["z"]), &tasks);
        assert_eq!(chosen.as_deref(), Some("z"));
    }
}
