//! Job records and the job status machine.

use crate::ids::{ContainerHandle, JobId, PipelineId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_ERROR_LEN: usize = 400;

/// Status of a single job. Codes are stable and used for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted = 0,
    Running = 1,
    TimedOut = 2,
    DockerError = 3,
    NotFound = 4,
    /// Finished with any exit code; success additionally needs exit code 0.
    Finished = 5,
    FailedToStart = 6,
    Cancelled = 7,
    DependencyFailed = 8,
}

impl JobStatus {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            0 => JobStatus::NotStarted,
            1 => JobStatus::Running,
            2 => JobStatus::TimedOut,
            3 => JobStatus::DockerError,
            4 => JobStatus::NotFound,
            5 => JobStatus::Finished,
            6 => JobStatus::FailedToStart,
            7 => JobStatus::Cancelled,
            8 => JobStatus::DependencyFailed,
            _ => return None,
        })
    }

    pub fn is_complete(self) -> bool {
        !matches!(self, JobStatus::NotStarted | JobStatus::Running)
    }

    /// Whether the status machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            NotStarted => matches!(
                next,
                Running | DependencyFailed | Cancelled | FailedToStart | NotFound
            ),
            Running => matches!(
                next,
                Finished | TimedOut | DockerError | NotFound | Cancelled
            ),
            _ => false,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            JobStatus::NotStarted => "Not started",
            JobStatus::Running => "Running",
            JobStatus::TimedOut => "Timed out",
            JobStatus::DockerError => "Docker error",
            JobStatus::NotFound => "Not found",
            JobStatus::Finished => "Finished",
            JobStatus::FailedToStart => "Failed to start",
            JobStatus::Cancelled => "Cancelled",
            JobStatus::DependencyFailed => "Dependency failed",
        }
    }
}

/// A container-backed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub name: String,
    /// Cleared once the container has been reclaimed.
    pub container: Option<ContainerHandle>,
    pub timeout_secs: Option<f64>,
    pub status: JobStatus,
    pub error: String,
    pub exit_code: Option<i64>,
    pub output: String,
    /// Host clock reading taken when we issued the start.
    pub host_started_at: Option<DateTime<Utc>>,
    pub uptime_secs: f64,
    pub parents: Vec<JobId>,
}

impl Job {
    pub fn new(
        pipeline_id: PipelineId,
        name: impl Into<String>,
        container: ContainerHandle,
        timeout_secs: Option<f64>,
    ) -> Self {
        Self {
            id: JobId::new(),
            pipeline_id,
            name: name.into(),
            container: Some(container),
            timeout_secs,
            status: JobStatus::NotStarted,
            error: String::new(),
            exit_code: None,
            output: String::new(),
            host_started_at: None,
            uptime_secs: 0.0,
            parents: Vec::new(),
        }
    }

    /// Started and stopped running, for whatever reason.
    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }

    pub fn is_successful(&self) -> bool {
        self.status == JobStatus::Finished && self.exit_code == Some(0)
    }

    pub fn is_failed(&self) -> bool {
        self.is_complete() && !self.is_successful()
    }

    /// Move to `next`, rejecting anything the status machine forbids.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record an error message, truncated to the stored width.
    pub fn set_error(&mut self, message: &str) {
        self.error = message
            .chars()
            .filter(|c| *c != '\0')
            .take(MAX_ERROR_LEN)
            .collect();
    }

    pub fn container_handle(&self) -> Result<&ContainerHandle> {
        self.container
            .as_ref()
            .ok_or_else(|| Error::ContainerReleased(self.name.clone()))
    }

    /// Record-level checks applied before a job is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.chars().count() > MAX_NAME_LEN {
            return Err(self.invalid(format!("name must be 1 to {MAX_NAME_LEN} characters")));
        }

        if let Some(handle) = &self.container
            && !is_container_id(handle.as_str())
        {
            return Err(self.invalid(format!(
                "container id '{handle}' is not a 64 digit hexadecimal id"
            )));
        }

        if let Some(timeout) = self.timeout_secs
            && (!timeout.is_finite() || timeout < 0.0)
        {
            return Err(self.invalid(format!("timeout {timeout} is not a finite positive number")));
        }

        Ok(())
    }

    fn invalid(&self, reason: String) -> Error {
        Error::InvalidJobSpec {
            job: self.name.clone(),
            reason,
        }
    }
}

fn is_container_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HANDLE: &str = "3f4e8d2c1b0a99887766554433221100ffeeddccbbaa00112233445566778899";

    fn job() -> Job {
        Job::new(PipelineId::new(), "build", ContainerHandle::new(HANDLE), None)
    }

    #[test]
    fn test_completion_predicates_hold_for_every_status() {
        let all = [
            JobStatus::NotStarted,
            JobStatus::Running,
            JobStatus::TimedOut,
            JobStatus::DockerError,
            JobStatus::NotFound,
            JobStatus::Finished,
            JobStatus::FailedToStart,
            JobStatus::Cancelled,
            JobStatus::DependencyFailed,
        ];

        for status in all {
            for exit_code in [None, Some(0), Some(1)] {
                let mut j = job();
                j.status = status;
                j.exit_code = exit_code;

                assert_eq!(
                    j.is_successful(),
                    status == JobStatus::Finished && exit_code == Some(0)
                );
                assert_eq!(j.is_failed(), j.is_complete() && !j.is_successful());
                assert_eq!(
                    j.is_complete(),
                    !matches!(status, JobStatus::NotStarted | JobStatus::Running)
                );
            }
        }
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for code in 0..=8 {
            let status = JobStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(JobStatus::from_code(9), None);
    }

    #[test]
    fn test_terminal_statuses_reject_transitions() {
        let mut j = job();
        j.transition(JobStatus::Running).unwrap();
        j.transition(JobStatus::Finished).unwrap();

        let err = j.transition(JobStatus::TimedOut).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: JobStatus::Finished,
                to: JobStatus::TimedOut
            }
        ));
    }

    #[test]
    fn test_not_started_cannot_finish() {
        let mut j = job();
        assert!(j.transition(JobStatus::Finished).is_err());
        assert!(j.transition(JobStatus::DependencyFailed).is_ok());
    }

    #[test]
    fn test_validate_container_id() {
        assert!(job().validate().is_ok());

        let mut j = job();
        j.container = Some(ContainerHandle::new("not-hex"));
        assert!(matches!(j.validate(), Err(Error::InvalidJobSpec { .. })));
    }

    #[test]
    fn test_validate_timeout() {
        let mut j = job();
        j.timeout_secs = Some(f64::NAN);
        assert!(j.validate().is_err());
        j.timeout_secs = Some(1.5);
        assert!(j.validate().is_ok());
    }

    #[test]
    fn test_error_is_truncated() {
        let mut j = job();
        j.set_error(&"x".repeat(1000));
        assert_eq!(j.error.len(), MAX_ERROR_LEN);
    }
}
