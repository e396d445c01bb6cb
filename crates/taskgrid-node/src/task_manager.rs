//! Task manager: the node's execution-subsystem bookkeeping.
//!
//! Every running task is registered here under a node-local id. The entry
//! owns the task's cancellation signal; cancelling flips a `watch` flag
//! that the task logic observes through its handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{NodeError, NodeResult};

/// Node-local task identifier, unrelated to allocation ids.
pub type LocalTaskId = u64;

/// Public view of a registered task.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: LocalTaskId,
    /// Task category, e.g. `"persistent"`.
    pub kind: String,
    /// Action name derived from the task type.
    pub action: String,
    pub description: String,
    /// Unix timestamp (seconds) of registration.
    pub start_time: u64,
    pub cancelled: bool,
}

/// Returned by [`TaskManager::register`].
#[derive(Debug)]
pub struct Registration {
    pub id: LocalTaskId,
    /// Flips to `true` once the task is cancelled.
    pub cancelled: watch::Receiver<bool>,
}

struct Entry {
    info: TaskInfo,
    cancel_tx: watch::Sender<bool>,
}

/// Registry of tasks executing on this node.
pub struct TaskManager {
    node_id: String,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<LocalTaskId, Entry>>,
}

impl TaskManager {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register a new task and hand back its id and cancellation receiver.
    pub fn register(&self, kind: &str, action: &str, description: String) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancelled) = watch::channel(false);
        let info = TaskInfo {
            id,
            kind: kind.to_string(),
            action: action.to_string(),
            description,
            start_time: epoch_secs(),
            cancelled: false,
        };
        self.lock().insert(id, Entry { info, cancel_tx });
        trace!(node_id = %self.node_id, task = id, %kind, %action, "task registered");
        Registration { id, cancelled }
    }

    /// Remove a task. Returns false if it was not registered.
    pub fn unregister(&self, id: LocalTaskId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        trace!(node_id = %self.node_id, task = id, removed, "task unregistered");
        removed
    }

    /// Signal cancellation to a registered task.
    ///
    /// The task stays registered until its logic returns and the handle
    /// completes.
    pub fn cancel(&self, id: LocalTaskId, reason: &str) -> NodeResult<()> {
        let mut tasks = self.lock();
        let entry = tasks.get_mut(&id).ok_or(NodeError::TaskNotFound(id))?;
        entry.info.cancelled = true;
        // Receivers may already be gone if the task logic has returned.
        let _ = entry.cancel_tx.send(true);
        debug!(node_id = %self.node_id, task = id, %reason, "task cancelled");
        Ok(())
    }

    pub fn get(&self, id: LocalTaskId) -> Option<TaskInfo> {
        self.lock().get(&id).map(|e| e.info.clone())
    }

    /// All registered tasks, ordered by id.
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<LocalTaskId, Entry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
