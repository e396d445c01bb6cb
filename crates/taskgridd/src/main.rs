//! taskgridd: the TaskGrid daemon.
//!
//! Runs a coordinator with a redb-backed task table and a set of
//! in-process nodes that execute the built-in task types.
//!
//! # Usage
//!
//! ```text
//! taskgridd standalone --config taskgrid.toml --data-dir ./taskgrid-data --nodes 3
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use taskgrid_coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
use taskgrid_state::{ClusterState, StateStore};
use taskgridd::{DaemonConfig, LocalCluster, builtin_executors};

#[derive(Parser)]
#[command(name = "taskgridd", about = "TaskGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a coordinator and its nodes in one process.
    Standalone {
        /// Path to taskgrid.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the task table (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Number of nodes (overrides the config file).
        #[arg(long)]
        nodes: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskgridd=debug,taskgrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            data_dir,
            nodes,
        } => {
            let mut daemon_config = match config {
                Some(path) => DaemonConfig::from_file(&path)?,
                None => DaemonConfig::default(),
            };
            if let Some(dir) = data_dir {
                daemon_config.cluster.data_dir = Some(dir);
            }
            if let Some(n) = nodes {
                daemon_config.cluster.nodes = n;
            }
            run_standalone(daemon_config).await
        }
    }
}

async fn run_standalone(config: DaemonConfig) -> anyhow::Result<()> {
    info!("TaskGrid daemon starting in standalone mode");

    let data_dir = config
        .cluster
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("taskgrid-data"));
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("taskgrid.redb");

    // ── Coordinator ────────────────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    let coordinator = Arc::new(Coordinator::with_store(
        CoordinatorConfig {
            max_failures: config.cluster.max_failures,
        },
        store,
    )?);

    // ── Nodes ──────────────────────────────────────────────────

    let mut cluster = LocalCluster::new(coordinator.clone(), builtin_executors());
    for i in 1..=config.cluster.nodes {
        cluster.start_node(&format!("node-{i}"))?;
    }
    info!(nodes = config.cluster.nodes, "nodes started");

    // ── Startup tasks ──────────────────────────────────────────

    for task in &config.tasks {
        match coordinator.create_persistent_task(&task.id, &task.task_name, task.params.clone()) {
            Ok(_) => {}
            Err(CoordinatorError::TaskAlreadyExists(id)) => {
                info!(task_id = %id, "task already present, keeping persisted copy");
            }
            Err(e) => return Err(e.into()),
        }
    }

    // ── Status reporting ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = tokio::spawn(report_states(coordinator.subscribe(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reporter.await;
    cluster.shutdown().await;

    for failure in coordinator.failures()? {
        warn!(
            task_id = %failure.task_id,
            failures = failure.failures,
            kind = ?failure.kind,
            error = %failure.error,
            "task dropped"
        );
    }

    info!("TaskGrid daemon stopped");
    Ok(())
}

async fn report_states(
    mut states: watch::Receiver<Arc<ClusterState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                info!(
                    version = state.version,
                    nodes = state.nodes.len(),
                    tasks = state.tasks.len(),
                    unassigned = state.tasks.unassigned().count(),
                    "cluster state"
                );
            }
            _ = shutdown.changed() => break,
        }
    }
}
