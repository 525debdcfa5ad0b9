//! Pipeline records and the declarative pipeline document.
//!
//! A document is what a client submits: a name, optional shared working
//! directory settings and a list of job specs with their parent edges. It is
//! validated here without touching any external system.

use crate::container::Mount;
use crate::ids::PipelineId;
use crate::job::MAX_NAME_LEN;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Aggregate status of a pipeline. Codes are stable and used for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    NotStarted = 0,
    /// There are still jobs to be run.
    Running = 1,
    /// Everything that could run has run, and at least one job failed.
    Failed = 2,
    /// Every job succeeded.
    Finished = 3,
    Cancelled = 4,
}

impl PipelineStatus {
    pub const ACTIVE: [PipelineStatus; 2] = [PipelineStatus::NotStarted, PipelineStatus::Running];
    pub const COMPLETE: [PipelineStatus; 3] = [
        PipelineStatus::Failed,
        PipelineStatus::Finished,
        PipelineStatus::Cancelled,
    ];

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            0 => PipelineStatus::NotStarted,
            1 => PipelineStatus::Running,
            2 => PipelineStatus::Failed,
            3 => PipelineStatus::Finished,
            4 => PipelineStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_complete(self) -> bool {
        !Self::ACTIVE.contains(&self)
    }

    pub fn description(self) -> &'static str {
        match self {
            PipelineStatus::NotStarted => "Not started",
            PipelineStatus::Running => "Running",
            PipelineStatus::Failed => "Failed",
            PipelineStatus::Finished => "Finished",
            PipelineStatus::Cancelled => "Cancelled",
        }
    }
}

/// Shared working directory mounted into every job of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Workdir {
    /// Allocated by fastci and deleted on cleanup.
    Temporary(PathBuf),
    /// Supplied by the caller; never deleted.
    Bound(PathBuf),
}

impl Workdir {
    pub fn path(&self) -> &PathBuf {
        match self {
            Workdir::Temporary(path) | Workdir::Bound(path) => path,
        }
    }
}

/// Repository checkout shared by all jobs of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RepoSource {
    pub url: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub status: PipelineStatus,
    pub workdir: Option<Workdir>,
    pub repo: Option<RepoSource>,
    pub cleaned_up: bool,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PipelineId::new(),
            name: name.into(),
            status: PipelineStatus::NotStarted,
            workdir: None,
            repo: None,
            cleaned_up: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }

    /// Still eligible for reconciliation.
    pub fn is_active(&self) -> bool {
        !self.cleaned_up && !self.is_complete()
    }
}

/// Declarative description of a job inside a pipeline document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_timeout")]
    #[schemars(with = "Option<f64>")]
    pub timeout_secs: Option<f64>,
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidJobSpec {
            job: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is required".into()));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(invalid(format!("name exceeds {MAX_NAME_LEN} characters")));
        }
        if self.image.trim().is_empty() {
            return Err(invalid("image is required".into()));
        }
        if self.command.trim().is_empty() {
            return Err(invalid("command is required".into()));
        }
        if let Some(timeout) = self.timeout_secs
            && (!timeout.is_finite() || timeout < 0.0)
        {
            return Err(invalid(format!(
                "timeout_secs must be a finite, non-negative number, got {timeout}"
            )));
        }
        self.mounts().map_err(invalid)?;

        Ok(())
    }

    /// The job's own volumes as bind mounts.
    pub fn mounts(&self) -> std::result::Result<Vec<Mount>, String> {
        self.volumes.iter().map(|v| Mount::parse(v)).collect()
    }
}

/// Accepts a JSON number or a numeric string.
fn deserialize_timeout<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("timeout_secs '{s}' is not a number"))),
    }
}

/// A pipeline creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PipelineDocument {
    pub name: String,
    /// Allocate a temporary directory shared by every job.
    #[serde(default)]
    pub shared_workdir: bool,
    /// Bind an existing host directory as the shared working directory.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    pub jobs: Vec<JobSpec>,
    /// Child job name to the names of the jobs it waits for.
    #[serde(default)]
    pub parents: BTreeMap<String, Vec<String>>,
}

impl PipelineDocument {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::InvalidDocument(e.to_string()))
    }

    pub fn repo_source(&self) -> Result<Option<RepoSource>> {
        match (&self.repo_url, &self.commit_hash) {
            (Some(url), Some(commit)) => Ok(Some(RepoSource {
                url: url.clone(),
                commit: commit.clone(),
            })),
            (None, None) => Ok(None),
            _ => Err(Error::IncompleteRepoSource),
        }
    }

    /// Whether the jobs need a directory allocated by us.
    pub fn needs_temporary_workdir(&self) -> bool {
        self.workdir.is_none() && (self.shared_workdir || self.repo_url.is_some())
    }

    pub fn parents_of(&self, job: &str) -> &[String] {
        self.parents.get(job).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Structural checks. Cycle detection is left to the dependency graph.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.chars().count() > MAX_NAME_LEN {
            return Err(Error::InvalidPipeline(format!(
                "name must be 1 to {MAX_NAME_LEN} characters"
            )));
        }
        if self.jobs.is_empty() {
            return Err(Error::InvalidPipeline("a pipeline needs at least one job".into()));
        }

        let repo = self.repo_source()?;
        if repo.is_some() && self.workdir.is_some() {
            return Err(Error::ConflictingWorkdir);
        }
        if self.shared_workdir && self.workdir.is_some() {
            return Err(Error::InvalidPipeline(
                "shared_workdir and workdir are mutually exclusive".into(),
            ));
        }
        if let Some(workdir) = &self.workdir
            && !workdir.is_absolute()
        {
            return Err(Error::InvalidPipeline(format!(
                "workdir '{}' must be an absolute path",
                workdir.display()
            )));
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !names.insert(job.name.as_str()) {
                return Err(Error::DuplicateJobName(job.name.clone()));
            }
        }

        for (child, parents) in &self.parents {
            if !names.contains(child.as_str()) {
                return Err(Error::InvalidPipeline(format!(
                    "parents given for unknown job '{child}'"
                )));
            }
            for parent in parents {
                if !names.contains(parent.as_str()) {
                    return Err(Error::UnknownParent {
                        job: child.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn document(raw: &str) -> Result<PipelineDocument> {
        PipelineDocument::from_json(raw)
    }

    const BASIC: &str = r#"{
        "name": "basic",
        "jobs": [
            {"name": "build", "image": "alpine", "command": "make"},
            {"name": "test", "image": "alpine", "command": "make test", "timeout_secs": "2.5"}
        ],
        "parents": {"test": ["build"]}
    }"#;

    #[test]
    fn test_parse_basic_document() {
        let doc = document(BASIC).unwrap();
        doc.validate().unwrap();

        assert_eq!(doc.jobs[1].timeout_secs, Some(2.5));
        assert_eq!(doc.parents_of("test"), &["build".to_string()]);
        assert!(doc.parents_of("build").is_empty());
        assert!(!doc.needs_temporary_workdir());
    }

    #[test]
    fn test_volumes_must_be_strings() {
        let err = document(
            r#"{"name": "p", "jobs": [{"name": "a", "image": "i", "command": "c", "volumes": [1]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
    }

    #[test]
    fn test_timeout_must_be_a_number() {
        let err = document(
            r#"{"name": "p", "jobs": [{"name": "a", "image": "i", "command": "c", "timeout_secs": "soon"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
    }

    #[test]
    fn test_unknown_job_fields_are_rejected() {
        let err = document(
            r#"{"name": "p", "jobs": [{"name": "a", "image": "i", "command": "c", "privileged": true}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
    }

    #[test]
    fn test_duplicate_job_names() {
        let doc = document(
            r#"{"name": "p", "jobs": [
                {"name": "a", "image": "i", "command": "c"},
                {"name": "a", "image": "i", "command": "c"}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(doc.validate(), Err(Error::DuplicateJobName(name)) if name == "a"));
    }

    #[test]
    fn test_repo_source_needs_both_halves() {
        let doc = document(
            r#"{"name": "p", "repo_url": "https://example.com/r.git",
                "jobs": [{"name": "a", "image": "i", "command": "c"}]}"#,
        )
        .unwrap();
        assert!(matches!(doc.validate(), Err(Error::IncompleteRepoSource)));
    }

    #[test]
    fn test_repo_mode_excludes_custom_workdir() {
        let doc = document(
            r#"{"name": "p", "repo_url": "https://example.com/r.git", "commit_hash": "abc",
                "workdir": "/srv/work",
                "jobs": [{"name": "a", "image": "i", "command": "c"}]}"#,
        )
        .unwrap();
        assert!(matches!(doc.validate(), Err(Error::ConflictingWorkdir)));
    }

    #[test]
    fn test_repo_mode_needs_temporary_workdir() {
        let doc = document(
            r#"{"name": "p", "repo_url": "https://example.com/r.git", "commit_hash": "abc",
                "jobs": [{"name": "a", "image": "i", "command": "c"}]}"#,
        )
        .unwrap();
        doc.validate().unwrap();
        assert!(doc.needs_temporary_workdir());
        assert_eq!(
            doc.repo_source().unwrap(),
            Some(RepoSource {
                url: "https://example.com/r.git".into(),
                commit: "abc".into()
            })
        );
    }

    #[test]
    fn test_unknown_parent() {
        let doc = document(
            r#"{"name": "p", "jobs": [{"name": "a", "image": "i", "command": "c"}],
                "parents": {"a": ["ghost"]}}"#,
        )
        .unwrap();
        assert!(matches!(doc.validate(), Err(Error::UnknownParent { .. })));
    }

    #[test]
    fn test_malformed_volume() {
        let doc = document(
            r#"{"name": "p", "jobs": [{"name": "a", "image": "i", "command": "c", "volumes": ["nocolon"]}]}"#,
        )
        .unwrap();
        assert!(matches!(doc.validate(), Err(Error::InvalidJobSpec { .. })));
    }

    #[test]
    fn test_pipeline_status_codes() {
        for code in 0..=4 {
            assert_eq!(PipelineStatus::from_code(code).unwrap().code(), code);
        }
        assert!(PipelineStatus::Cancelled.is_complete());
        assert!(!PipelineStatus::Running.is_complete());
    }
}
