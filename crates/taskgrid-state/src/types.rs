//! Domain types for the TaskGrid cluster state.
//!
//! A `PersistentTask` is the coordinator's record of one logical task. Its
//! `allocation_id` identifies the current assignment attempt: every
//! (re)assignment issues a fresh, strictly greater id, so a node can tell a
//! continuation of its attempt apart from a revoke-and-recreate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Stable identifier for a persistent task across its whole lifetime.
pub type TaskId = String;

/// Identifier of a single assignment attempt. Never reused.
pub type AllocationId = u64;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

// ── Persistent task ───────────────────────────────────────────────

/// One entry in the coordinator's task table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentTask {
    pub id: TaskId,
    pub allocation_id: AllocationId,
    /// Task-type name, used by nodes to resolve an executor.
    pub task_name: String,
    /// Opaque request payload handed to the executor.
    pub params: serde_json::Value,
    /// Node the task is assigned to (`None` = waiting for placement).
    pub executor_node: Option<NodeId>,
    /// Number of failed attempts reported so far.
    pub failures: u32,
    /// Unix timestamp (seconds) when the task was created.
    pub created_at: u64,
}

impl PersistentTask {
    /// Whether the task currently has an executor node.
    pub fn is_assigned(&self) -> bool {
        self.executor_node.is_some()
    }

    /// Whether the task is assigned to `node_id`.
    pub fn is_assigned_to(&self, node_id: &str) -> bool {
        self.executor_node.as_deref() == Some(node_id)
    }
}

/// The coordinator-authored task table.
///
/// Ordered by task id so every node iterates assignments in the same order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistentTasks {
    last_allocation_id: AllocationId,
    tasks: BTreeMap<TaskId, PersistentTask>,
}

impl PersistentTasks {
    /// Create an empty task table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from persisted parts.
    ///
    /// The allocation counter is raised to the largest id present so a
    /// truncated counter can never hand out an id that is already in use.
    pub fn from_parts(
        last_allocation_id: AllocationId,
        tasks: impl IntoIterator<Item = PersistentTask>,
    ) -> Self {
        let tasks: BTreeMap<TaskId, PersistentTask> =
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        let highest = tasks.values().map(|t| t.allocation_id).max().unwrap_or(0);
        Self {
            last_allocation_id: last_allocation_id.max(highest),
            tasks,
        }
    }

    /// Highest allocation id issued so far.
    pub fn last_allocation_id(&self) -> AllocationId {
        self.last_allocation_id
    }

    pub fn get(&self, task_id: &str) -> Option<&PersistentTask> {
        self.tasks.get(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// All tasks, ordered by task id.
    pub fn tasks(&self) -> impl Iterator<Item = &PersistentTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Find the task whose current attempt carries `allocation_id`.
    pub fn find_allocation(&self, allocation_id: AllocationId) -> Option<&PersistentTask> {
        self.tasks.values().find(|t| t.allocation_id == allocation_id)
    }

    /// Tasks assigned to `node_id`.
    pub fn assigned_to<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a PersistentTask> {
        self.tasks.values().filter(move |t| t.is_assigned_to(node_id))
    }

    /// Tasks waiting for placement.
    pub fn unassigned(&self) -> impl Iterator<Item = &PersistentTask> {
        self.tasks.values().filter(|t| !t.is_assigned())
    }

    /// Issue the next allocation id.
    pub fn next_allocation_id(&mut self) -> AllocationId {
        self.last_allocation_id += 1;
        self.last_allocation_id
    }

    /// Add a new task with a freshly issued allocation id.
    pub fn add(
        &mut self,
        task_id: &str,
        task_name: &str,
        params: serde_json::Value,
        executor_node: Option<NodeId>,
        created_at: u64,
    ) -> StateResult<&PersistentTask> {
        if self.tasks.contains_key(task_id) {
            return Err(StateError::AlreadyExists(task_id.to_string()));
        }
        let allocation_id = self.next_allocation_id();
        let task = PersistentTask {
            id: task_id.to_string(),
            allocation_id,
            task_name: task_name.to_string(),
            params,
            executor_node,
            failures: 0,
            created_at,
        };
        Ok(&*self.tasks.entry(task_id.to_string()).or_insert(task))
    }

    /// Move a task to `executor_node` under a new allocation id.
    ///
    /// A new id is issued even when the node does not change: the old
    /// attempt is revoked either way.
    pub fn reassign(
        &mut self,
        task_id: &str,
        executor_node: Option<NodeId>,
    ) -> Option<&PersistentTask> {
        if !self.tasks.contains_key(task_id) {
            return None;
        }
        let allocation_id = self.next_allocation_id();
        let task = self.tasks.get_mut(task_id)?;
        task.allocation_id = allocation_id;
        task.executor_node = executor_node;
        Some(&*task)
    }

    /// Bump the failure counter of a task, returning the new count.
    pub fn record_failure(&mut self, task_id: &str) -> Option<u32> {
        let task = self.tasks.get_mut(task_id)?;
        task.failures += 1;
        Some(task.failures)
    }

    pub fn remove(&mut self, task_id: &str) -> Option<PersistentTask> {
        self.tasks.remove(task_id)
    }
}

// ── Cluster state ─────────────────────────────────────────────────

/// Immutable snapshot of the cluster as published by the coordinator.
///
/// Shared as `Arc<ClusterState>`; the task table sits behind its own `Arc`
/// so snapshots that only change membership share it by reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterState {
    pub version: u64,
    pub nodes: BTreeSet<NodeId>,
    pub tasks: Arc<PersistentTasks>,
}

impl ClusterState {
    /// The state a node starts from before it has seen any snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }
}

// ── Failures ──────────────────────────────────────────────────────

/// How an attempt failed, which decides whether it is worth retrying.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task logic ran and failed. Retried under a new allocation.
    #[default]
    Runtime,
    /// The task can never run as configured (e.g. no executor for its
    /// type). Never retried.
    Config,
}

/// A failed attempt as reported by the node that ran it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Runtime,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Config,
            message: message.into(),
        }
    }

    /// Whether the coordinator may hand the task out again.
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Runtime
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A task the coordinator gave up on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub allocation_id: AllocationId,
    pub task_name: String,
    pub failures: u32,
    /// Kind of the last failed attempt.
    #[serde(default)]
    pub kind: FailureKind,
    /// Error message from the last failed attempt.
    pub error: String,
    /// Unix timestamp when the task was dropped.
    pub failed_at: u64,
}

impl FailureRecord {
    /// Build the composite key for the failures table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.task_id, self.allocation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn allocation_ids_strictly_increase() {
        let mut tasks = PersistentTasks::new();
        let a = tasks
            .add("t1", "sleep", json!({}), Some("node-1".into()), 1000)
            .unwrap()
            .allocation_id;
        let b = tasks
            .add("t2", "sleep", json!({}), None, 1000)
            .unwrap()
            .allocation_id;
        assert!(b > a);

        // Reassigning to the same node still issues a new id.
        let c = tasks
            .reassign("t1", Some("node-1".into()))
            .unwrap()
            .allocation_id;
        assert!(c > b);
        assert_eq!(tasks.last_allocation_id(), c);
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let mut tasks = PersistentTasks::new();
        tasks.add("t1", "sleep", json!({}), None, 1000).unwrap();
        let err = tasks.add("t1", "echo", json!({}), None, 1000).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(id) if id == "t1"));
        // The failed add must not burn an allocation id.
        assert_eq!(tasks.last_allocation_id(), 1);
    }

    #[test]
    fn reassign_unknown_task_returns_none() {
        let mut tasks = PersistentTasks::new();
        assert!(tasks.reassign("missing", None).is_none());
        assert_eq!(tasks.last_allocation_id(), 0);
    }

    #[test]
    fn assigned_and_unassigned_views() {
        let mut tasks = PersistentTasks::new();
        tasks.add("a", "sleep", json!({}), Some("node-1".into()), 0).unwrap();
        tasks.add("b", "sleep", json!({}), Some("node-2".into()), 0).unwrap();
        tasks.add("c", "sleep", json!({}), None, 0).unwrap();

        let on_one: Vec<_> = tasks.assigned_to("node-1").map(|t| t.id.as_str()).collect();
        assert_eq!(on_one, vec!["a"]);
        let pending: Vec<_> = tasks.unassigned().map(|t| t.id.as_str()).collect();
        assert_eq!(pending, vec!["c"]);
    }

    #[test]
    fn find_allocation_matches_current_attempt_only() {
        let mut tasks = PersistentTasks::new();
        let first = tasks
            .add("t1", "sleep", json!({}), Some("node-1".into()), 0)
            .unwrap()
            .allocation_id;
        tasks.reassign("t1", Some("node-2".into()));

        assert!(tasks.find_allocation(first).is_none());
        let current = tasks.get("t1").unwrap().allocation_id;
        assert_eq!(tasks.find_allocation(current).unwrap().id, "t1");
    }

    #[test]
    fn from_parts_never_lowers_the_counter() {
        let task = PersistentTask {
            id: "t1".into(),
            allocation_id: 42,
            task_name: "sleep".into(),
            params: json!({}),
            executor_node: None,
            failures: 0,
            created_at: 0,
        };
        let mut tasks = PersistentTasks::from_parts(7, vec![task]);
        assert_eq!(tasks.last_allocation_id(), 42);
        assert_eq!(tasks.next_allocation_id(), 43);
    }

    #[test]
    fn record_failure_counts_up() {
        let mut tasks = PersistentTasks::new();
        tasks.add("t1", "sleep", json!({}), None, 0).unwrap();
        assert_eq!(tasks.record_failure("t1"), Some(1));
        assert_eq!(tasks.record_failure("t1"), Some(2));
        assert_eq!(tasks.record_failure("missing"), None);
    }

    #[test]
    fn only_runtime_failures_are_retryable() {
        assert!(TaskFailure::runtime("disk full").is_retryable());
        assert!(!TaskFailure::config("no executor").is_retryable());
        assert_eq!(TaskFailure::config("no executor").to_string(), "no executor");
    }

    #[test]
    fn failure_record_without_kind_reads_as_runtime() {
        let record: FailureRecord = serde_json::from_value(json!({
            "task_id": "t1",
            "allocation_id": 2,
            "task_name": "sleep",
            "failures": 3,
            "error": "boom",
            "failed_at": 1000
        }))
        .unwrap();
        assert_eq!(record.kind, FailureKind::Runtime);
    }

    #[test]
    fn persistent_task_roundtrips_through_json() {
        let task = PersistentTask {
            id: "t1".into(),
            allocation_id: 3,
            task_name: "echo".into(),
            params: json!({"message": "hi"}),
            executor_node: Some("node-1".into()),
            failures: 1,
            created_at: 1000,
        };
        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: PersistentTask = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, task);
    }
}
