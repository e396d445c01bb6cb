//! In-process cluster: one coordinator and any number of nodes.
//!
//! Each node gets its own task manager, allocation registry and applier
//! loop subscribed to the coordinator's snapshot channel. Completion
//! reports reach the coordinator through [`CoordinatorLink`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use taskgrid_coordinator::{Coordinator, CoordinatorError};
use taskgrid_node::{
    ClusterStateApplier, CompletionError, CompletionFuture, CoordinatorClient, ExecutorRegistry,
    PersistentTasksService, Reconciler, TaskManager,
};
use taskgrid_state::{AllocationId, TaskFailure};

/// [`CoordinatorClient`] calling a coordinator in the same process.
pub struct CoordinatorLink {
    coordinator: Arc<Coordinator>,
}

impl CoordinatorLink {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

impl CoordinatorClient for CoordinatorLink {
    fn complete_persistent_task(
        &self,
        task_id: &str,
        allocation_id: AllocationId,
        failure: Option<TaskFailure>,
    ) -> CompletionFuture {
        let coordinator = self.coordinator.clone();
        let task_id = task_id.to_string();
        Box::pin(async move {
            coordinator
                .complete_persistent_task(&task_id, allocation_id, failure)
                .map_err(|e| match e {
                    CoordinatorError::TaskNotFound(id) => CompletionError::NotFound(id),
                    CoordinatorError::InvalidRequest(reason) => CompletionError::Invalid(reason),
                    other => CompletionError::Unavailable(other.to_string()),
                })
        })
    }
}

struct LocalNode {
    reconciler: Arc<Reconciler>,
    handle: JoinHandle<()>,
}

pub struct LocalCluster {
    coordinator: Arc<Coordinator>,
    executors: Arc<ExecutorRegistry>,
    nodes: Vec<LocalNode>,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalCluster {
    pub fn new(coordinator: Arc<Coordinator>, executors: ExecutorRegistry) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            coordinator,
            executors: Arc::new(executors),
            nodes: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Start a node and announce it to the coordinator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_node(&mut self, node_id: &str) -> anyhow::Result<Arc<Reconciler>> {
        if self.node(node_id).is_some() {
            anyhow::bail!("node already started: {node_id}");
        }

        let service = Arc::new(PersistentTasksService::new(
            Arc::new(CoordinatorLink::new(self.coordinator.clone())),
            Arc::new(TaskManager::new(node_id)),
        ));
        let reconciler = Arc::new(Reconciler::new(node_id, self.executors.clone(), service));
        let applier = ClusterStateApplier::new(reconciler.clone());
        let handle = tokio::spawn(applier.run(
            self.coordinator.subscribe(),
            self.shutdown_tx.subscribe(),
        ));
        self.nodes.push(LocalNode {
            reconciler: reconciler.clone(),
            handle,
        });

        self.coordinator.node_joined(node_id)?;
        info!(%node_id, "node started");
        Ok(reconciler)
    }

    /// Take a node out of the cluster.
    ///
    /// Its tasks are reassigned; the node keeps following cluster state, so
    /// it cancels its copies locally once it sees the reassignment.
    pub fn remove_node(&self, node_id: &str) -> anyhow::Result<()> {
        self.coordinator.node_left(node_id)?;
        debug!(%node_id, "node removed from cluster");
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Option<&Arc<Reconciler>> {
        self.nodes
            .iter()
            .map(|n| &n.reconciler)
            .find(|r| r.node_id() == node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|n| n.reconciler.node_id().to_string())
            .collect()
    }

    /// Stop every node's applier loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for node in self.nodes {
            let _ = node.handle.await;
        }
        info!("local cluster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_coordinator::CoordinatorConfig;

    #[tokio::test]
    async fn link_keeps_missing_id_apart_from_stale_allocation() {
        let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
        coordinator.node_joined("node-1").unwrap();
        let task = coordinator
            .create_persistent_task("t1", "echo", serde_json::json!({}))
            .unwrap();
        let link = CoordinatorLink::new(coordinator);

        let missing = link.complete_persistent_task("", task.allocation_id, None).await;
        assert_eq!(
            missing.unwrap_err(),
            CompletionError::Invalid("task id is missing".into())
        );

        let stale = link
            .complete_persistent_task("t1", task.allocation_id + 1, None)
            .await;
        assert_eq!(stale.unwrap_err(), CompletionError::NotFound("t1".into()));
    }
}
