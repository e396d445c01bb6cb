//! taskgrid-state: shared cluster state model for TaskGrid.
//!
//! Defines the coordinator-authored task table (`PersistentTasks`), the
//! immutable `ClusterState` snapshot every node reconciles against, and the
//! `ClusterChangedEvent` that pairs two consecutive snapshots.
//!
//! # Persistence
//!
//! The coordinator keeps its task table in a [redb](https://docs.rs/redb)
//! database through `StateStore`, so allocation ids keep growing across
//! restarts. Values are JSON-serialized into `&[u8]` columns.

pub mod error;
pub mod event;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use event::ClusterChangedEvent;
pub use store::StateStore;
pub use types::*;
