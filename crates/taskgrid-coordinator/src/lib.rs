//! taskgrid-coordinator: owner of the persistent-task table.
//!
//! The [`Coordinator`] assigns tasks to nodes, reacts to membership
//! changes, handles completion reports, and publishes each resulting
//! `ClusterState` to subscribed nodes.

pub mod assigner;
pub mod coordinator;
pub mod error;

pub use assigner::{Assigner, LeastLoadedAssigner};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{CoordinatorError, CoordinatorResult};
