//! Coordinator: the single authority over the persistent-task table.
//!
//! Owns the current `ClusterState`, applies membership changes and task
//! lifecycle requests to it, and publishes every new version on a `watch`
//! channel. Each mutation clones the current state, bumps `version`,
//! persists the task table (when a store is attached) and publishes the
//! new snapshot, all under one lock.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskgrid_state::{
    AllocationId, ClusterState, FailureRecord, NodeId, PersistentTask, PersistentTasks,
    StateStore, TaskFailure,
};

use crate::assigner::{Assigner, LeastLoadedAssigner};
use crate::error::{CoordinatorError, CoordinatorResult};

/// Coordinator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Failed attempts after which a task is dropped. Zero retries runtime
    /// failures forever. Config failures are never retried.
    pub max_failures: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { max_failures: 3 }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    store: Option<StateStore>,
    assigner: Box<dyn Assigner>,
    current: Mutex<Arc<ClusterState>>,
    publisher: watch::Sender<Arc<ClusterState>>,
}

impl Coordinator {
    /// Create a coordinator with an empty, unpersisted task table.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::from_state(config, None, ClusterState::empty())
    }

    /// Create a coordinator backed by `store`, reloading its task table.
    ///
    /// Membership is not persisted, so every reloaded task starts
    /// unassigned and is placed again as nodes join.
    pub fn with_store(config: CoordinatorConfig, store: StateStore) -> CoordinatorResult<Self> {
        let state = match store.load_tasks()? {
            Some((tasks, version)) => {
                let last_allocation_id = tasks.last_allocation_id();
                let unassigned = tasks.tasks().cloned().map(|mut task| {
                    task.executor_node = None;
                    task
                });
                let tasks = PersistentTasks::from_parts(last_allocation_id, unassigned);
                info!(
                    tasks = tasks.len(),
                    last_allocation_id,
                    version,
                    "task table reloaded"
                );
                ClusterState {
                    version,
                    nodes: BTreeSet::new(),
                    tasks: Arc::new(tasks),
                }
            }
            None => ClusterState::empty(),
        };
        Ok(Self::from_state(config, Some(store), state))
    }

    fn from_state(config: CoordinatorConfig, store: Option<StateStore>, state: ClusterState) -> Self {
        let state = Arc::new(state);
        let (publisher, _) = watch::channel(state.clone());
        Self {
            config,
            store,
            assigner: Box::new(LeastLoadedAssigner),
            current: Mutex::new(state),
            publisher,
        }
    }

    /// Replace the placement strategy.
    pub fn with_assigner(mut self, assigner: impl Assigner + 'static) -> Self {
        self.assigner = Box::new(assigner);
        self
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.config
    }

    /// Receive every published cluster state, starting with the current one.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.publisher.subscribe()
    }

    /// The current cluster state.
    pub fn state(&self) -> Arc<ClusterState> {
        self.lock().clone()
    }

    /// Tasks the coordinator gave up on. Empty without a store.
    pub fn failures(&self) -> CoordinatorResult<Vec<FailureRecord>> {
        match &self.store {
            Some(store) => Ok(store.list_failures()?),
            None => Ok(Vec::new()),
        }
    }

    // ── Membership ────────────────────────────────────────────────

    /// Add a node and place any unassigned tasks.
    pub fn node_joined(&self, node_id: &str) -> CoordinatorResult<()> {
        self.update(|nodes, tasks| {
            if !nodes.insert(node_id.to_string()) {
                return Ok(());
            }
            info!(%node_id, "node joined");
            self.place_unassigned(nodes, tasks);
            Ok(())
        })
    }

    /// Remove a node and move its tasks elsewhere under new allocation ids.
    pub fn node_left(&self, node_id: &str) -> CoordinatorResult<()> {
        self.update(|nodes, tasks| {
            if !nodes.remove(node_id) {
                return Ok(());
            }
            info!(%node_id, "node left");
            let orphaned: Vec<PersistentTask> = tasks.assigned_to(node_id).cloned().collect();
            for task in orphaned {
                let target = self.assigner.assign(&task, nodes, tasks);
                if let Some(moved) = tasks.reassign(&task.id, target) {
                    debug!(
                        task_id = %moved.id,
                        from = %node_id,
                        to = ?moved.executor_node,
                        allocation_id = moved.allocation_id,
                        "task reassigned"
                    );
                }
            }
            Ok(())
        })
    }

    fn place_unassigned(&self, nodes: &BTreeSet<NodeId>, tasks: &mut PersistentTasks) {
        let pending: Vec<PersistentTask> = tasks.unassigned().cloned().collect();
        for task in pending {
            let Some(node) = self.assigner.assign(&task, nodes, tasks) else {
                continue;
            };
            if let Some(placed) = tasks.reassign(&task.id, Some(node)) {
                debug!(
                    task_id = %placed.id,
                    node_id = ?placed.executor_node,
                    allocation_id = placed.allocation_id,
                    "task placed"
                );
            }
        }
    }

    // ── Task lifecycle ────────────────────────────────────────────

    /// Create a task and place it.
    pub fn create_persistent_task(
        &self,
        task_id: &str,
        task_name: &str,
        params: serde_json::Value,
    ) -> CoordinatorResult<PersistentTask> {
        require_task_id(task_id)?;
        self.update(|nodes, tasks| {
            if tasks.contains(task_id) {
                return Err(CoordinatorError::TaskAlreadyExists(task_id.to_string()));
            }
            let created_at = epoch_secs();
            let candidate = PersistentTask {
                id: task_id.to_string(),
                allocation_id: tasks.last_allocation_id() + 1,
                task_name: task_name.to_string(),
                params: params.clone(),
                executor_node: None,
                failures: 0,
                created_at,
            };
            let node = self.assigner.assign(&candidate, nodes, tasks);
            let task = tasks
                .add(task_id, task_name, params, node, created_at)?
                .clone();
            info!(
                %task_id,
                %task_name,
                allocation_id = task.allocation_id,
                node_id = ?task.executor_node,
                "persistent task created"
            );
            Ok(task)
        })
    }

    /// Remove a task; a node running it cancels it on the next snapshot.
    pub fn remove_persistent_task(&self, task_id: &str) -> CoordinatorResult<PersistentTask> {
        require_task_id(task_id)?;
        self.update(|_, tasks| {
            let removed = tasks
                .remove(task_id)
                .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
            info!(%task_id, allocation_id = removed.allocation_id, "persistent task removed");
            Ok(removed)
        })
    }

    /// Handle a node's report that an allocation finished.
    ///
    /// Requests for an unknown task or a superseded allocation are answered
    /// with `TaskNotFound` and change nothing. A success removes the task.
    /// A runtime failure reassigns it under a new allocation id, or drops it
    /// once `max_failures` attempts have failed. A config failure drops it
    /// straight away.
    pub fn complete_persistent_task(
        &self,
        task_id: &str,
        allocation_id: AllocationId,
        failure: Option<TaskFailure>,
    ) -> CoordinatorResult<PersistentTask> {
        require_task_id(task_id)?;
        self.update_recording(|nodes, tasks, dropped| {
            let task = match tasks.get(task_id) {
                Some(task) if task.allocation_id == allocation_id => task.clone(),
                Some(task) => {
                    debug!(
                        %task_id,
                        allocation_id,
                        current_allocation_id = task.allocation_id,
                        "completion for superseded allocation"
                    );
                    return Err(CoordinatorError::TaskNotFound(task_id.to_string()));
                }
                None => {
                    debug!(%task_id, allocation_id, "completion for unknown task");
                    return Err(CoordinatorError::TaskNotFound(task_id.to_string()));
                }
            };

            let Some(failure) = failure else {
                tasks.remove(task_id);
                info!(%task_id, allocation_id, "persistent task completed");
                return Ok(task);
            };

            let failures = tasks.record_failure(task_id).unwrap_or(task.failures + 1);
            let exhausted = self.config.max_failures > 0 && failures >= self.config.max_failures;
            if exhausted || !failure.is_retryable() {
                let mut removed = tasks
                    .remove(task_id)
                    .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
                removed.failures = failures;
                dropped.push(FailureRecord {
                    task_id: removed.id.clone(),
                    allocation_id,
                    task_name: removed.task_name.clone(),
                    failures,
                    kind: failure.kind,
                    error: failure.message.clone(),
                    failed_at: epoch_secs(),
                });
                warn!(
                    %task_id,
                    allocation_id,
                    failures,
                    kind = ?failure.kind,
                    error = %failure,
                    "persistent task failed permanently"
                );
                return Ok(removed);
            }

            let mut retry = task;
            retry.failures = failures;
            let target = self.assigner.assign(&retry, nodes, tasks);
            let reassigned = tasks
                .reassign(task_id, target)
                .cloned()
                .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
            warn!(
                %task_id,
                allocation_id,
                failures,
                next_allocation_id = reassigned.allocation_id,
                node_id = ?reassigned.executor_node,
                error = %failure,
                "persistent task failed, reassigned"
            );
            Ok(reassigned)
        })
    }

    // ── State transitions ─────────────────────────────────────────

    /// Apply `mutate` to a copy of the current state and publish the result
    /// if anything changed. An error leaves the current state untouched.
    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut BTreeSet<NodeId>, &mut PersistentTasks) -> CoordinatorResult<T>,
    ) -> CoordinatorResult<T> {
        self.update_recording(|nodes, tasks, _| mutate(nodes, tasks))
    }

    /// `update`, where `mutate` may also queue failure records. They are
    /// stored in the same transaction as the task table.
    fn update_recording<T>(
        &self,
        mutate: impl FnOnce(
            &mut BTreeSet<NodeId>,
            &mut PersistentTasks,
            &mut Vec<FailureRecord>,
        ) -> CoordinatorResult<T>,
    ) -> CoordinatorResult<T> {
        let mut current = self.lock();
        let mut nodes = current.nodes.clone();
        let mut tasks = PersistentTasks::clone(&current.tasks);
        let mut dropped = Vec::new();

        let out = mutate(&mut nodes, &mut tasks, &mut dropped)?;

        let tasks_changed = tasks != *current.tasks;
        if !tasks_changed && nodes == current.nodes {
            return Ok(out);
        }

        let version = current.version + 1;
        let tasks = if tasks_changed {
            if let Some(store) = &self.store {
                store.save_tasks_with_failures(&tasks, version, &dropped)?;
            }
            Arc::new(tasks)
        } else {
            current.tasks.clone()
        };

        let next = Arc::new(ClusterState {
            version,
            nodes,
            tasks,
        });
        *current = next.clone();
        self.publisher.send_replace(next);
        debug!(version, tasks_changed, "cluster state published");
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, Arc<ClusterState>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn require_task_id(task_id: &str) -> CoordinatorResult<()> {
    if task_id.is_empty() {
        return Err(CoordinatorError::InvalidRequest("task id is missing".into()));
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
