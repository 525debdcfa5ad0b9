//! Types exchanged with the container runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Classification of runtime failures, modelled on the Docker Engine status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorKind {
    /// 400: the request was rejected (bad image command, invalid config...).
    BadRequest,
    /// 404: the container does not exist any more.
    NotFound,
    /// 409: the container is not in a state that allows the operation.
    Conflict,
    /// Anything else, including transport failures.
    Other,
}

impl RuntimeErrorKind {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            400 => RuntimeErrorKind::BadRequest,
            404 => RuntimeErrorKind::NotFound,
            409 => RuntimeErrorKind::Conflict,
            _ => RuntimeErrorKind::Other,
        }
    }
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeErrorKind::BadRequest => "bad request",
            RuntimeErrorKind::NotFound => "not found",
            RuntimeErrorKind::Conflict => "conflict",
            RuntimeErrorKind::Other => "runtime failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::NotFound, message)
    }
}

/// Lifecycle status reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// The process inside the container is gone for good.
    pub fn has_exited(&self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }
}

/// Snapshot of a container as returned by an inspect call.
///
/// Timestamps come from the runtime's clock and are only comparable with each
/// other. `None` means the runtime reported its "unset" sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerState {
    /// State of a container that was created but never started.
    pub fn created() -> Self {
        Self {
            status: ContainerStatus::Created,
            exit_code: None,
            error: String::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Run time measured purely on the runtime clock, if the container finished.
    pub fn runtime_duration_secs(&self) -> Option<f64> {
        let finished = self.finished_at?;
        let started = self.started_at?;
        Some((finished - started).num_microseconds().unwrap_or(0) as f64 / 1e6)
    }
}

/// A bind mount in `source:target[:ro|rw]` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_write(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// Parse a Docker-style volume string.
    pub fn parse(volume: &str) -> Result<Self, String> {
        let parts: Vec<&str> = volume.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            [_, _, mode] => return Err(format!("unknown volume mode '{mode}'")),
            _ => return Err(format!("expected 'source:target[:ro|rw]', got '{volume}'")),
        };

        if source.is_empty() || target.is_empty() {
            return Err(format!("empty source or target in '{volume}'"));
        }
        if !target.starts_with('/') {
            return Err(format!("target '{target}' must be an absolute path"));
        }

        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }

    /// Render as a `HostConfig.Binds` entry.
    pub fn to_bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.source, self.target, mode)
    }
}

/// Everything the runtime needs to create a (not yet started) container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub labels: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_mount_parse() {
        let mount = Mount::parse("/data:/workdir").unwrap();
        assert_eq!(mount, Mount::read_write("/data", "/workdir"));

        let mount = Mount::parse("cache:/root/.cache:ro").unwrap();
        assert!(mount.read_only);
        assert_eq!(mount.to_bind(), "cache:/root/.cache:ro");
    }

    #[test]
    fn test_mount_parse_rejects_garbage() {
        assert!(Mount::parse("/only-one-part").is_err());
        assert!(Mount::parse("/a:relative").is_err());
        assert!(Mount::parse("/a:/b:rx").is_err());
        assert!(Mount::parse(":/b").is_err());
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(RuntimeErrorKind::from_status_code(400), RuntimeErrorKind::BadRequest);
        assert_eq!(RuntimeErrorKind::from_status_code(404), RuntimeErrorKind::NotFound);
        assert_eq!(RuntimeErrorKind::from_status_code(409), RuntimeErrorKind::Conflict);
        assert_eq!(RuntimeErrorKind::from_status_code(500), RuntimeErrorKind::Other);
    }

    #[test]
    fn test_runtime_duration() {
        let mut state = ContainerState::created();
        assert_eq!(state.runtime_duration_secs(), None);

        state.started_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
        state.finished_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 42).unwrap());
        assert_eq!(state.runtime_duration_secs(), Some(42.0));
    }
}
