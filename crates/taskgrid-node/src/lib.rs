//! taskgrid-node: the node side of persistent-task reconciliation.
//!
//! Every node receives cluster-state snapshots from the coordinator and
//! converges its locally running tasks onto the assignments that name it:
//!
//! - [`Reconciler`] diffs one snapshot transition against the
//!   [`AllocationRegistry`], starting new allocations and cancelling revoked
//!   ones.
//! - [`AllocatedTask`] is the per-allocation handle with its
//!   STARTED → PENDING_CANCEL → COMPLETED state machine.
//! - [`PersistentTasksService`] talks to the coordinator and the local
//!   [`TaskManager`].
//! - [`ClusterStateApplier`] feeds published snapshots to the reconciler
//!   one at a time.

pub mod applier;
pub mod error;
pub mod executor;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod task;
pub mod task_manager;

#[cfg(test)]
mod testing;

pub use applier::ClusterStateApplier;
pub use error::{CompletionError, NodeError, NodeResult};
pub use executor::{ExecutorRegistry, NodeTaskExecutor, PersistentTasksExecutor, TaskFuture};
pub use reconciler::{ReconcileSummary, Reconciler};
pub use registry::{AllocationRegistry, AllocationStatus};
pub use service::{CompletionFuture, CoordinatorClient, PersistentTasksService};
pub use task::{AllocatedTask, TaskState, TaskStatus};
pub use task_manager::{LocalTaskId, Registration, TaskInfo, TaskManager};
