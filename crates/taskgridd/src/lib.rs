//! taskgridd: assembles a coordinator, in-process nodes and the built-in
//! executors into a runnable cluster.

pub mod builtin;
pub mod cluster;
pub mod config;

pub use builtin::{EchoExecutor, SleepExecutor, builtin_executors};
pub use cluster::{CoordinatorLink, LocalCluster};
pub use config::{ClusterConfig, DaemonConfig, TaskConfig};
