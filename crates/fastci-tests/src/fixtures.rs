//! Pipeline document factories.

use fastci_core::pipeline::{JobSpec, PipelineDocument};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Factory for pipeline documents.
pub struct DocumentFixture;

impl DocumentFixture {
    pub fn job(name: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            image: "alpine:3.20".to_string(),
            command: format!("echo {name}"),
            volumes: vec![],
            timeout_secs: None,
        }
    }

    /// A document over `jobs` with `edges` given as (child, parent) pairs.
    pub fn with_edges(name: &str, jobs: &[&str], edges: &[(&str, &str)]) -> PipelineDocument {
        let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (child, parent) in edges {
            parents
                .entry(child.to_string())
                .or_default()
                .push(parent.to_string());
        }

        PipelineDocument {
            name: name.to_string(),
            shared_workdir: false,
            workdir: None,
            repo_url: None,
            commit_hash: None,
            jobs: jobs.iter().map(|j| Self::job(j)).collect(),
            parents,
        }
    }

    /// One job, no dependencies.
    pub fn single() -> PipelineDocument {
        Self::with_edges("single", &["build"], &[])
    }

    /// build -> test -> deploy
    pub fn chain() -> PipelineDocument {
        Self::with_edges(
            "chain",
            &["build", "test", "deploy"],
            &[("test", "build"), ("deploy", "test")],
        )
    }

    /// A -> {B, C}
    pub fn fan_out() -> PipelineDocument {
        Self::with_edges("fan-out", &["a", "b", "c"], &[("b", "a"), ("c", "a")])
    }

    /// fetch -> {lint, test} -> report
    pub fn diamond() -> PipelineDocument {
        Self::with_edges(
            "diamond",
            &["fetch", "lint", "test", "report"],
            &[
                ("lint", "fetch"),
                ("test", "fetch"),
                ("report", "lint"),
                ("report", "test"),
            ],
        )
    }

    /// A single job limited to `timeout_secs`.
    pub fn with_timeout(timeout_secs: f64) -> PipelineDocument {
        let mut doc = Self::single();
        doc.name = "timeout".to_string();
        doc.jobs[0].timeout_secs = Some(timeout_secs);
        doc
    }

    /// A chain sharing a temporary working directory.
    pub fn shared_workdir() -> PipelineDocument {
        let mut doc = Self::chain();
        doc.name = "shared".to_string();
        doc.shared_workdir = true;
        doc
    }

    /// A chain bound to an existing host directory.
    pub fn bound_workdir(path: PathBuf) -> PipelineDocument {
        let mut doc = Self::chain();
        doc.name = "bound".to_string();
        doc.workdir = Some(path);
        doc
    }

    /// A single job checking out a repository.
    pub fn repo() -> PipelineDocument {
        let mut doc = Self::single();
        doc.name = "repo".to_string();
        doc.repo_url = Some("https://example.com/acme/widgets.git".to_string());
        doc.commit_hash = Some("9fceb02d0ae598e95dc970b74767f19372d61af8".to_string());
        doc
    }
}
