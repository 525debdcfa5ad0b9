//! Error types for fastci.

use crate::container::{RuntimeError, RuntimeErrorKind};
use crate::job::JobStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline document validation
    #[error("Invalid pipeline document: {0}")]
    InvalidDocument(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Invalid job '{job}': {reason}")]
    InvalidJobSpec { job: String, reason: String },

    #[error("Names of jobs in a single pipeline must be unique: '{0}' appears more than once")]
    DuplicateJobName(String),

    #[error("Job '{job}' depends on unknown job '{parent}'")]
    UnknownParent { job: String, parent: String },

    #[error("A repository checkout cannot be combined with a custom working directory")]
    ConflictingWorkdir,

    #[error("repo_url and commit_hash must be given together")]
    IncompleteRepoSource,

    #[error("Cycle detected in job dependencies at '{0}'")]
    CycleDetected(String),

    // State errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Illegal job transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job '{0}' has not completed")]
    JobNotComplete(String),

    #[error("Pipeline {0} has not completed")]
    PipelineNotComplete(String),

    #[error("Container of job '{0}' was already released")]
    ContainerReleased(String),

    // Runtime errors
    #[error("Container of job '{job}' disappeared: {message}")]
    ContainerNotFound { job: String, message: String },

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Invalid runtime timestamp: {0}")]
    InvalidTimestamp(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors raised while checking a pipeline document, before any side effect.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidDocument(_)
                | Error::InvalidPipeline(_)
                | Error::InvalidJobSpec { .. }
                | Error::DuplicateJobName(_)
                | Error::UnknownParent { .. }
                | Error::ConflictingWorkdir
                | Error::IncompleteRepoSource
                | Error::CycleDetected(_)
        )
    }

    /// Runtime failures that mean our view and the runtime's have drifted apart.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::ContainerNotFound { .. } => true,
            Error::Runtime(e) => !matches!(
                e.kind,
                RuntimeErrorKind::BadRequest | RuntimeErrorKind::Conflict
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(Error::DuplicateJobName("build".into()).is_validation());
        assert!(Error::CycleDetected("a".into()).is_validation());
        assert!(!Error::Database("down".into()).is_validation());
    }

    #[test]
    fn test_fatal_classification() {
        let gone = Error::ContainerNotFound {
            job: "build".into(),
            message: "no such container".into(),
        };
        assert!(gone.is_fatal());

        let unavailable = Error::from(RuntimeError::new(RuntimeErrorKind::Other, "socket closed"));
        assert!(unavailable.is_fatal());

        let conflict = Error::from(RuntimeError::new(RuntimeErrorKind::Conflict, "not running"));
        assert!(!conflict.is_fatal());
    }
}
