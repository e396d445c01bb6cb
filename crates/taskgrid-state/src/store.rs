//! StateStore: redb-backed persistence for the coordinator's task table.
//!
//! The task table is written as a whole on every coordinator mutation so
//! the persisted copy always matches one published snapshot. Failure
//! records are append-only and are written in the same transaction as the
//! table that drops their task. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(FAILURES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Task table ─────────────────────────────────────────────────

    /// Replace the persisted task table with `tasks` in one transaction.
    pub fn save_tasks(&self, tasks: &PersistentTasks, version: u64) -> StateResult<()> {
        self.save_tasks_with_failures(tasks, version, &[])
    }

    /// Replace the persisted task table and append `failures` in the same
    /// transaction, so a dropped task and its failure record land together
    /// or not at all.
    pub fn save_tasks_with_failures(
        &self,
        tasks: &PersistentTasks,
        version: u64,
        failures: &[FailureRecord],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let stale: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .map(|entry| entry.map(|(key, _)| key.value().to_string()))
                .collect::<Result<_, _>>()
                .map_err(map_err!(Read))?;
            for key in stale.iter().filter(|k| !tasks.contains(k)) {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for task in tasks.tasks() {
                let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
                table
                    .insert(task.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(META_LAST_ALLOCATION_ID, tasks.last_allocation_id())
                .map_err(map_err!(Write))?;
            meta.insert(META_VERSION, version).map_err(map_err!(Write))?;

            if !failures.is_empty() {
                let mut table = txn.open_table(FAILURES).map_err(map_err!(Table))?;
                for record in failures {
                    let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                    table
                        .insert(record.table_key().as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            tasks = tasks.len(),
            last_allocation_id = tasks.last_allocation_id(),
            version,
            failures = failures.len(),
            "task table stored"
        );
        Ok(())
    }

    /// Load the persisted task table and the version it was saved at.
    ///
    /// Returns `None` for a store that has never been written to.
    pub fn load_tasks(&self) -> StateResult<Option<(PersistentTasks, u64)>> {
        let last_allocation_id = self.get_meta(META_LAST_ALLOCATION_ID)?;
        let tasks = self.list_tasks()?;
        if last_allocation_id.is_none() && tasks.is_empty() {
            return Ok(None);
        }
        let version = self.get_meta(META_VERSION)?.unwrap_or(0);
        Ok(Some((
            PersistentTasks::from_parts(last_allocation_id.unwrap_or(0), tasks),
            version,
        )))
    }

    /// Insert or update a single task.
    pub fn put_task(&self, task: &PersistentTask) -> StateResult<()> {
        let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table
                .insert(task.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a task by id.
    pub fn get_task(&self, task_id: &str) -> StateResult<Option<PersistentTask>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        match table.get(task_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let task: PersistentTask =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// List all persisted tasks, ordered by task id.
    pub fn list_tasks(&self) -> StateResult<Vec<PersistentTask>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let task: PersistentTask =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(task);
        }
        Ok(results)
    }

    /// Delete a task by id. Returns true if it existed.
    pub fn delete_task(&self, task_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            existed = table.remove(task_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%task_id, existed, "task deleted");
        Ok(existed)
    }

    // ── Failures ───────────────────────────────────────────────────

    /// Record a task that was dropped after repeated failures.
    pub fn record_failure(&self, record: &FailureRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(FAILURES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "failure recorded");
        Ok(())
    }

    /// List all failure records.
    pub fn list_failures(&self) -> StateResult<Vec<FailureRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FAILURES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: FailureRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    // ── Meta ───────────────────────────────────────────────────────

    fn get_meta(&self, key: &str) -> StateResult<Option<u64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(table.get(key).map_err(map_err!(Read))?.map(|guard| guard.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tasks() -> PersistentTasks {
        let mut tasks = PersistentTasks::new();
        tasks
            .add("reindex", "sleep", json!({"duration_ms": 10}), Some("node-1".into()), 1000)
            .unwrap();
        tasks
            .add("rollup", "echo", json!({"message": "hi"}), None, 1000)
            .unwrap();
        tasks
    }

    #[test]
    fn fresh_store_has_no_task_table() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.load_tasks().unwrap().is_none());
        assert!(store.list_tasks().unwrap().is_empty());
    }

    #[test]
    fn save_and_load_task_table() {
        let store = StateStore::open_in_memory().unwrap();
        let tasks = sample_tasks();

        store.save_tasks(&tasks, 7).unwrap();
        let (loaded, version) = store.load_tasks().unwrap().unwrap();

        assert_eq!(loaded, tasks);
        assert_eq!(version, 7);
    }

    #[test]
    fn save_drops_tasks_no_longer_present() {
        let store = StateStore::open_in_memory().unwrap();
        let mut tasks = sample_tasks();
        store.save_tasks(&tasks, 1).unwrap();

        tasks.remove("reindex");
        store.save_tasks(&tasks, 2).unwrap();

        assert!(store.get_task("reindex").unwrap().is_none());
        assert!(store.get_task("rollup").unwrap().is_some());
    }

    #[test]
    fn counter_survives_empty_table() {
        let store = StateStore::open_in_memory().unwrap();
        let mut tasks = sample_tasks();
        tasks.remove("reindex");
        tasks.remove("rollup");
        store.save_tasks(&tasks, 3).unwrap();

        let (mut loaded, _) = store.load_tasks().unwrap().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.next_allocation_id(), 3);
    }

    #[test]
    fn put_get_delete_task() {
        let store = StateStore::open_in_memory().unwrap();
        let tasks = sample_tasks();
        let task = tasks.get("rollup").unwrap();

        store.put_task(task).unwrap();
        assert_eq!(store.get_task("rollup").unwrap().as_ref(), Some(task));
        assert!(store.delete_task("rollup").unwrap());
        assert!(!store.delete_task("rollup").unwrap());
    }

    #[test]
    fn failures_are_listed() {
        let store = StateStore::open_in_memory().unwrap();
        let record = FailureRecord {
            task_id: "reindex".into(),
            allocation_id: 4,
            task_name: "sleep".into(),
            failures: 3,
            kind: FailureKind::Runtime,
            error: "boom".into(),
            failed_at: 2000,
        };
        store.record_failure(&record).unwrap();

        assert_eq!(store.list_failures().unwrap(), vec![record]);
    }

    #[test]
    fn dropped_task_and_its_failure_are_stored_together() {
        let store = StateStore::open_in_memory().unwrap();
        let mut tasks = sample_tasks();
        store.save_tasks(&tasks, 1).unwrap();

        let dropped = tasks.remove("reindex").unwrap();
        let record = FailureRecord {
            task_id: dropped.id.clone(),
            allocation_id: dropped.allocation_id,
            task_name: dropped.task_name.clone(),
            failures: 1,
            kind: FailureKind::Config,
            error: "no executor registered for task type: sleep".into(),
            failed_at: 2000,
        };
        store
            .save_tasks_with_failures(&tasks, 2, std::slice::from_ref(&record))
            .unwrap();

        let (loaded, version) = store.load_tasks().unwrap().unwrap();
        assert_eq!(version, 2);
        assert!(!loaded.contains("reindex"));
        assert_eq!(store.list_failures().unwrap(), vec![record]);
    }

    #[test]
    fn plain_save_writes_no_failures() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_tasks(&sample_tasks(), 1).unwrap();
        assert!(store.list_failures().unwrap().is_empty());
    }

    #[test]
    fn on_disk_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskgrid.redb");
        let tasks = sample_tasks();

        {
            let store = StateStore::open(&path).unwrap();
            store.save_tasks(&tasks, 5).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let (loaded, version) = store.load_tasks().unwrap().unwrap();
        assert_eq!(loaded, tasks);
        assert_eq!(version, 5);
    }
}
