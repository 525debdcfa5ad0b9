//! Shared working directories, mounts and job commands.

use crate::config::WorkspaceConfig;
use fastci_core::container::Mount;
use fastci_core::pipeline::{JobSpec, RepoSource, Workdir};
use fastci_core::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Builds what a job container sees of its pipeline.
#[derive(Debug, Clone)]
pub struct Workspace {
    config: WorkspaceConfig,
}

impl Workspace {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Create a fresh directory under the configured root.
    pub fn allocate(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.temp_root)?;
        let path = tempfile::Builder::new()
            .prefix("fastci-")
            .tempdir_in(&self.config.temp_root)?
            .keep();
        debug!(path = %path.display(), "Allocated pipeline workdir");
        Ok(path)
    }

    /// Delete a temporary directory. Missing directories are fine.
    pub fn remove(&self, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed pipeline workdir");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "Pipeline workdir already gone");
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Mounts for one job: its own volumes, the shared workdir and, in repo
    /// mode, the bootstrap script.
    pub fn mounts(
        &self,
        spec: &JobSpec,
        workdir: Option<&Workdir>,
        repo: Option<&RepoSource>,
    ) -> Result<Vec<Mount>> {
        let mut mounts = spec.mounts().map_err(|reason| Error::InvalidJobSpec {
            job: spec.name.clone(),
            reason,
        })?;

        if let Some(workdir) = workdir {
            mounts.push(Mount::read_write(
                workdir.path().display().to_string(),
                self.config.pipeline_mount.clone(),
            ));
        }

        if repo.is_some() {
            mounts.push(Mount::read_only(
                self.config.bootstrap_script.display().to_string(),
                self.config.bootstrap_mount.clone(),
            ));
        }

        Ok(mounts)
    }

    /// Argument vector for the container. Repo mode runs the bootstrap
    /// script first, which checks out the commit and then execs the rest.
    pub fn command(&self, spec: &JobSpec, repo: Option<&RepoSource>) -> Vec<String> {
        let shell = ["sh".to_string(), "-c".to_string(), spec.command.clone()];
        match repo {
            Some(repo) => [
                self.config.interpreter.clone(),
                self.config.bootstrap_mount.clone(),
                repo.url.clone(),
                repo.commit.clone(),
            ]
            .into_iter()
            .chain(shell)
            .collect(),
            None => shell.to_vec(),
        }
    }
}
