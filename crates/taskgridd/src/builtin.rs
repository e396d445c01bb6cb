//! Built-in task types.
//!
//! - `sleep`: waits `duration_ms` (default 1000), stopping early when
//!   cancelled; fails at the end if `fail = true`.
//! - `echo`: logs `message` and completes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use taskgrid_node::{AllocatedTask, ExecutorRegistry, PersistentTasksExecutor, TaskFuture};

#[derive(Debug, Deserialize)]
struct SleepParams {
    #[serde(default = "default_duration_ms")]
    duration_ms: u64,
    #[serde(default)]
    fail: bool,
}

fn default_duration_ms() -> u64 {
    1000
}

pub struct SleepExecutor;

async fn run_sleep(task: Arc<AllocatedTask>, params: Arc<serde_json::Value>) -> anyhow::Result<()> {
    let params: SleepParams =
        serde_json::from_value(params.as_ref().clone()).context("invalid sleep params")?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(params.duration_ms)) => {}
        _ = task.cancelled() => {
            debug!(task_id = %task.persistent_task_id(), "sleep cancelled");
            return Ok(());
        }
    }

    if params.fail {
        anyhow::bail!("sleep finished with fail = true");
    }
    Ok(())
}

impl PersistentTasksExecutor for SleepExecutor {
    fn task_name(&self) -> &str {
        "sleep"
    }

    fn node_operation(
        &self,
        task: Arc<AllocatedTask>,
        params: Arc<serde_json::Value>,
    ) -> TaskFuture {
        Box::pin(run_sleep(task, params))
    }
}

#[derive(Debug, Default, Deserialize)]
struct EchoParams {
    #[serde(default)]
    message: String,
}

pub struct EchoExecutor;

async fn run_echo(task: Arc<AllocatedTask>, params: Arc<serde_json::Value>) -> anyhow::Result<()> {
    let params: EchoParams =
        serde_json::from_value(params.as_ref().clone()).context("invalid echo params")?;
    info!(
        task_id = %task.persistent_task_id(),
        allocation_id = task.allocation_id(),
        message = %params.message,
        "echo"
    );
    Ok(())
}

impl PersistentTasksExecutor for EchoExecutor {
    fn task_name(&self) -> &str {
        "echo"
    }

    fn node_operation(
        &self,
        task: Arc<AllocatedTask>,
        params: Arc<serde_json::Value>,
    ) -> TaskFuture {
        Box::pin(run_echo(task, params))
    }
}

/// Registry holding every built-in executor.
pub fn builtin_executors() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry
        .register(Arc::new(SleepExecutor))
        .register(Arc::new(EchoExecutor));
    registry
}
