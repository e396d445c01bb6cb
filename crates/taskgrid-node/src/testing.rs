//! Test doubles shared by the unit tests of this crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskgrid_state::{AllocationId, PersistentTask, TaskFailure};

use crate::error::CompletionError;
use crate::executor::{PersistentTasksExecutor, TaskFuture};
use crate::service::{CompletionFuture, CoordinatorClient, PersistentTasksService};
use crate::task::AllocatedTask;
use crate::task_manager::TaskManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub task_id: String,
    pub allocation_id: AllocationId,
    pub failure: Option<TaskFailure>,
}

/// Records every completion request; answers with success or `NotFound`.
pub struct RecordingClient {
    calls: Mutex<Vec<Completion>>,
    reject: bool,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reject: false,
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reject: true,
        })
    }

    pub fn calls(&self) -> Vec<Completion> {
        self.calls.lock().unwrap().clone()
    }
}

impl CoordinatorClient for RecordingClient {
    fn complete_persistent_task(
        &self,
        task_id: &str,
        allocation_id: AllocationId,
        failure: Option<TaskFailure>,
    ) -> CompletionFuture {
        self.calls.lock().unwrap().push(Completion {
            task_id: task_id.to_string(),
            allocation_id,
            failure,
        });
        let result = if self.reject {
            Err(CompletionError::NotFound(task_id.to_string()))
        } else {
            Ok(assigned(task_id, allocation_id, "sleep", "node-1"))
        };
        Box::pin(async move { result })
    }
}

pub fn service(client: Arc<RecordingClient>) -> Arc<PersistentTasksService> {
    Arc::new(PersistentTasksService::new(
        client,
        Arc::new(TaskManager::new("node-1")),
    ))
}

pub fn assigned(
    task_id: &str,
    allocation_id: AllocationId,
    task_name: &str,
    node_id: &str,
) -> PersistentTask {
    PersistentTask {
        id: task_id.to_string(),
        allocation_id,
        task_name: task_name.to_string(),
        params: serde_json::json!({}),
        executor_node: Some(node_id.to_string()),
        failures: 0,
        created_at: 1000,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// Completes as soon as it runs.
pub struct ImmediateExecutor(String);

impl ImmediateExecutor {
    pub fn named(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl PersistentTasksExecutor for ImmediateExecutor {
    fn task_name(&self) -> &str {
        &self.0
    }

    fn node_operation(
        &self,
        _task: Arc<AllocatedTask>,
        _params: Arc<serde_json::Value>,
    ) -> TaskFuture {
        Box::pin(async { Ok(()) })
    }
}

/// Fails as soon as it runs.
pub struct FailingExecutor(String);

impl FailingExecutor {
    pub fn named(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl PersistentTasksExecutor for FailingExecutor {
    fn task_name(&self) -> &str {
        &self.0
    }

    fn node_operation(
        &self,
        _task: Arc<AllocatedTask>,
        _params: Arc<serde_json::Value>,
    ) -> TaskFuture {
        Box::pin(async { Err(anyhow::anyhow!("executor failed")) })
    }
}

/// Runs until cancelled.
pub struct BlockingExecutor(String);

impl BlockingExecutor {
    pub fn named(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl PersistentTasksExecutor for BlockingExecutor {
    fn task_name(&self) -> &str {
        &self.0
    }

    fn node_operation(
        &self,
        task: Arc<AllocatedTask>,
        _params: Arc<serde_json::Value>,
    ) -> TaskFuture {
        Box::pin(async move {
            task.cancelled().await;
            Ok(())
        })
    }
}

/// Panics when polled.
pub struct PanickingExecutor;

async fn explode() -> anyhow::Result<()> {
    panic!("executor blew up")
}

impl PersistentTasksExecutor for PanickingExecutor {
    fn task_name(&self) -> &str {
        "sleep"
    }

    fn node_operation(
        &self,
        _task: Arc<AllocatedTask>,
        _params: Arc<serde_json::Value>,
    ) -> TaskFuture {
        Box::pin(explode())
    }
}
