//! taskgrid.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of in-process nodes.
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    pub data_dir: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            max_failures: default_max_failures(),
            data_dir: None,
        }
    }
}

/// A task submitted at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub task_name: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn default_nodes() -> usize {
    3
}

fn default_max_failures() -> u32 {
    3
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        Ok(config)
    }
}
