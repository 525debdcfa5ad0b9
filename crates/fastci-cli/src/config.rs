//! Daemon configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML
//! file, then `FASTCI__*` environment variables (`FASTCI__SCHEDULER__RETENTION=3`).

use fastci_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "FASTCI";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// PostgreSQL URL shared by the daemon and the one-shot commands.
    /// Without one, only `run` works, keeping its pipelines in memory.
    #[serde(default)]
    pub database_url: Option<String>,
    /// NATS URL. Without one, notifications stay in-process.
    #[serde(default)]
    pub nats_url: Option<String>,
    /// Docker endpoint; local defaults when unset.
    #[serde(default)]
    pub docker_host: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

impl DaemonConfig {
    /// Load from `path` (if given and present) and the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, env: config::Environment) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config = builder.add_source(env).build()?.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = DaemonConfig::load_with(None, env(&[])).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.log.filter, "info");
        assert_eq!(config.scheduler.retention, 10);
    }

    #[test]
    fn test_file_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fastci.yaml");
        std::fs::write(
            &path,
            "nats_url: nats://bus:4222\nscheduler:\n  retention: 4\n  tick_interval_ms: 250\n",
        )
        .unwrap();

        let config =
            DaemonConfig::load_with(Some(&path), env(&[("FASTCI__SCHEDULER__RETENTION", "2")]))
                .unwrap();

        assert_eq!(config.nats_url.as_deref(), Some("nats://bus:4222"));
        assert_eq!(config.scheduler.retention, 2);
        assert_eq!(config.scheduler.tick_interval_ms, 250);
    }

    #[test]
    fn test_missing_file_is_optional() {
        let config =
            DaemonConfig::load_with(Some(Path::new("/nonexistent/fastci.yaml")), env(&[])).unwrap();
        assert!(config.nats_url.is_none());
    }
}
