//! redb table definitions for the TaskGrid state store.

use redb::TableDefinition;

/// Persistent tasks keyed by task id.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Permanently failed tasks keyed by `{task_id}:{allocation_id}`.
pub const FAILURES: TableDefinition<&str, &[u8]> = TableDefinition::new("failures");

/// Scalar bookkeeping (`last_allocation_id`, `version`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const META_LAST_ALLOCATION_ID: &str = "last_allocation_id";
pub const META_VERSION: &str = "version";
