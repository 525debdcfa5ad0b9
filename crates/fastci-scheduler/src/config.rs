//! Scheduler configuration.

use fastci_core::ports::DEFAULT_NOTIFY_TOPIC;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reconciler and workspace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between reconciliation ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Number of most recent completed pipelines whose resources are kept.
    #[serde(default = "default_retention")]
    pub retention: usize,
    #[serde(default = "default_notify_topic")]
    pub notify_topic: String,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_retention() -> usize {
    10
}

fn default_notify_topic() -> String {
    DEFAULT_NOTIFY_TOPIC.to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            retention: default_retention(),
            notify_topic: default_notify_topic(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

/// Where shared working directories live and how jobs see them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Parent directory for temporary pipeline directories.
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    /// Mount point of the shared directory inside every job container.
    #[serde(default = "default_pipeline_mount")]
    pub pipeline_mount: String,
    /// Host path of the repository bootstrap script.
    #[serde(default = "default_bootstrap_script")]
    pub bootstrap_script: PathBuf,
    #[serde(default = "default_bootstrap_mount")]
    pub bootstrap_mount: String,
    /// Interpreter used to run the bootstrap script inside the container.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

fn default_temp_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_pipeline_mount() -> String {
    "/fastci/pipeline".to_string()
}

fn default_bootstrap_script() -> PathBuf {
    PathBuf::from("/usr/share/fastci/repo_bootstrap.py")
}

fn default_bootstrap_mount() -> String {
    "/fastci/internal/repo_bootstrap.py".to_string()
}

fn default_interpreter() -> String {
    "python3".to_string()
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            temp_root: default_temp_root(),
            pipeline_mount: default_pipeline_mount(),
            bootstrap_script: default_bootstrap_script(),
            bootstrap_mount: default_bootstrap_mount(),
            interpreter: default_interpreter(),
        }
    }
}
