//! Cluster-state applier: the single consumer of published snapshots.
//!
//! Snapshots arrive on a `watch` channel, so a slow pass coalesces
//! intermediate snapshots into the latest one. Reconciliation is
//! level-triggered, which makes that safe. Passes never overlap.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, trace};

use taskgrid_state::{ClusterChangedEvent, ClusterState};

use crate::reconciler::{ReconcileSummary, Reconciler};

pub struct ClusterStateApplier {
    reconciler: Arc<Reconciler>,
    applied: Arc<ClusterState>,
}

impl ClusterStateApplier {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            applied: Arc::new(ClusterState::empty()),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Version of the last snapshot handed to the reconciler.
    pub fn applied_version(&self) -> u64 {
        self.applied.version
    }

    /// Reconcile against `state`. Snapshots older than the last applied
    /// one are skipped.
    pub fn apply(&mut self, state: Arc<ClusterState>) -> ReconcileSummary {
        if state.version < self.applied.version {
            trace!(
                node_id = %self.reconciler.node_id(),
                version = state.version,
                applied = self.applied.version,
                "stale cluster state skipped"
            );
            return ReconcileSummary::default();
        }
        let event = ClusterChangedEvent::new(self.applied.clone(), state.clone());
        let summary = self.reconciler.cluster_changed(&event);
        self.applied = state;
        summary
    }

    /// Apply every published snapshot until shutdown or until the
    /// publisher goes away.
    pub async fn run(
        mut self,
        mut states: watch::Receiver<Arc<ClusterState>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(node_id = %self.reconciler.node_id(), "cluster state applier started");

        let initial = states.borrow_and_update().clone();
        self.apply(initial);

        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        debug!(node_id = %self.reconciler.node_id(), "cluster state publisher closed");
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    self.apply(state);
                }
                _ = shutdown.changed() => {
                    debug!(node_id = %self.reconciler.node_id(), "cluster state applier shutting down");
                    break;
                }
            }
        }
    }
}
