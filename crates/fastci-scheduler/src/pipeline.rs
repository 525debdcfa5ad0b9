//! Pipeline engine: creation, stepping, cancellation and cleanup.

use crate::config::SchedulerConfig;
use crate::dag::DependencyGraph;
use crate::job::JobEngine;
use crate::locks::PipelineLocks;
use crate::workspace::Workspace;
use fastci_core::ids::{JobId, PipelineId};
use fastci_core::job::{Job, JobStatus};
use fastci_core::pipeline::{Pipeline, PipelineDocument, PipelineStatus, Workdir};
use fastci_core::ports::{ChangeNotifier, ContainerRuntime, PipelineLease, PipelineStore};
use fastci_core::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Aggregate status implied by the current job statuses.
pub fn derive_status(current: PipelineStatus, jobs: &[Job]) -> PipelineStatus {
    if jobs.iter().all(Job::is_complete) {
        let only_cancelled = jobs.iter().all(|job| {
            job.is_successful()
                || matches!(job.status, JobStatus::Cancelled | JobStatus::DependencyFailed)
        });
        if only_cancelled && jobs.iter().any(|job| !job.is_successful()) {
            PipelineStatus::Cancelled
        } else if jobs.iter().any(Job::is_failed) {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Finished
        }
    } else if current == PipelineStatus::NotStarted {
        PipelineStatus::Running
    } else {
        current
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    complete: bool,
    successful: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    Blocked,
    Ready,
    Waiting,
}

/// Readiness of a NOT_STARTED job against the pre-step snapshot.
fn readiness(job: &Job, snapshot: &HashMap<JobId, Outcome>) -> Readiness {
    let parents: Vec<Outcome> = job
        .parents
        .iter()
        .filter_map(|id| snapshot.get(id).copied())
        .collect();

    if parents.iter().any(|p| p.complete && !p.successful) {
        Readiness::Blocked
    } else if parents.iter().all(|p| p.successful) {
        Readiness::Ready
    } else {
        Readiness::Waiting
    }
}

/// Write access to one pipeline. The local guard queues writers of this
/// process; the lease excludes other processes sharing the store.
struct WriteGuard {
    _local: OwnedMutexGuard<()>,
    _lease: PipelineLease,
}

/// A pipeline with its jobs, for display.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineView {
    pub pipeline: Pipeline,
    pub jobs: Vec<Job>,
    pub layers: Vec<Vec<String>>,
}

pub struct PipelineEngine {
    store: Arc<dyn PipelineStore>,
    jobs: JobEngine,
    notifier: Arc<dyn ChangeNotifier>,
    workspace: Workspace,
    locks: PipelineLocks,
    notify_topic: String,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        runtime: Arc<dyn ContainerRuntime>,
        notifier: Arc<dyn ChangeNotifier>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            jobs: JobEngine::new(runtime),
            notifier,
            workspace: Workspace::new(config.workspace.clone()),
            locks: PipelineLocks::new(),
            notify_topic: config.notify_topic.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn job_engine(&self) -> &JobEngine {
        &self.jobs
    }

    /// Tell observers that something changed. Failures are only logged.
    pub async fn notify_change(&self) {
        if let Err(e) = self.notifier.publish(&self.notify_topic).await {
            warn!(topic = %self.notify_topic, error = %e, "Failed to publish change notification");
        }
    }

    /// Validate a document, provision its jobs and store everything.
    pub async fn create(&self, doc: &PipelineDocument) -> Result<(Pipeline, Vec<Job>)> {
        doc.validate()?;
        DependencyGraph::from_document(doc)?.check_acyclic()?;

        let mut pipeline = Pipeline::new(doc.name.clone());
        pipeline.repo = doc.repo_source()?;
        pipeline.workdir = match &doc.workdir {
            Some(path) => Some(Workdir::Bound(path.clone())),
            None if doc.needs_temporary_workdir() => {
                Some(Workdir::Temporary(self.workspace.allocate()?))
            }
            None => None,
        };

        let mut jobs = Vec::with_capacity(doc.jobs.len());
        if let Err(e) = self.provision_all(&pipeline, doc, &mut jobs).await {
            error!(pipeline = %pipeline.name, error = %e, "Pipeline creation failed, rolling back");
            self.rollback(&pipeline, &jobs).await;
            return Err(e);
        }

        info!(
            pipeline_id = %pipeline.id,
            pipeline = %pipeline.name,
            jobs = jobs.len(),
            "Created pipeline"
        );
        Ok((pipeline, jobs))
    }

    async fn provision_all(
        &self,
        pipeline: &Pipeline,
        doc: &PipelineDocument,
        jobs: &mut Vec<Job>,
    ) -> Result<()> {
        for spec in &doc.jobs {
            let mounts =
                self.workspace
                    .mounts(spec, pipeline.workdir.as_ref(), pipeline.repo.as_ref())?;
            let command = self.workspace.command(spec, pipeline.repo.as_ref());
            let job = self
                .jobs
                .provision(pipeline.id, spec, mounts, command)
                .await?;
            jobs.push(job);
        }

        let ids: HashMap<String, JobId> = jobs.iter().map(|j| (j.name.clone(), j.id)).collect();
        for job in jobs.iter_mut() {
            job.parents = doc
                .parents_of(&job.name)
                .iter()
                .map(|name| {
                    ids.get(name).copied().ok_or_else(|| Error::UnknownParent {
                        job: job.name.clone(),
                        parent: name.clone(),
                    })
                })
                .collect::<Result<_>>()?;
        }

        self.store.create_pipeline(pipeline, jobs).await
    }

    async fn rollback(&self, pipeline: &Pipeline, jobs: &[Job]) {
        for handle in jobs.iter().filter_map(|job| job.container.as_ref()) {
            self.jobs.discard(handle).await;
        }
        if let Some(Workdir::Temporary(path)) = &pipeline.workdir
            && let Err(e) = self.workspace.remove(path)
        {
            warn!(path = %path.display(), error = %e, "Failed to remove workdir during rollback");
        }
    }

    async fn write_guard(&self, id: PipelineId) -> Result<WriteGuard> {
        let local = self.locks.lock(id).await;
        let lease = self.store.lock_pipeline(id).await?;
        Ok(WriteGuard {
            _local: local,
            _lease: lease,
        })
    }

    async fn load(&self, id: PipelineId) -> Result<Pipeline> {
        self.store
            .get_pipeline(id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))
    }

    async fn load_job(&self, id: JobId) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Advance every job of an active pipeline once. Returns whether any job
    /// or the pipeline itself changed status.
    pub async fn step(&self, id: PipelineId) -> Result<bool> {
        let _guard = self.write_guard(id).await?;

        let mut pipeline = self.load(id).await?;
        if !pipeline.is_active() {
            return Ok(false);
        }

        let mut jobs = self.store.jobs_for_pipeline(id).await?;
        let snapshot: HashMap<JobId, Outcome> = jobs
            .iter()
            .map(|job| {
                (
                    job.id,
                    Outcome {
                        complete: job.is_complete(),
                        successful: job.is_successful(),
                    },
                )
            })
            .collect();

        let mut changed = false;
        let mut failure = None;

        for job in jobs.iter_mut() {
            let before = job.status;
            let result = match job.status {
                JobStatus::NotStarted => match readiness(job, &snapshot) {
                    Readiness::Blocked => {
                        info!(job = %job.name, "Parent failed, not starting job");
                        job.transition(JobStatus::DependencyFailed)
                    }
                    Readiness::Ready => self.jobs.start(job).await,
                    Readiness::Waiting => Ok(()),
                },
                JobStatus::Running => self.jobs.update(job).await,
                _ => Ok(()),
            };

            changed |= job.status != before;
            self.store.update_job(job).await?;

            if let Err(e) = result {
                error!(pipeline_id = %id, job = %job.name, error = %e, "Job step failed");
                failure.get_or_insert(e);
            }
        }

        let status = derive_status(pipeline.status, &jobs);
        if status != pipeline.status {
            info!(
                pipeline_id = %id,
                from = pipeline.status.description(),
                to = status.description(),
                "Pipeline status changed"
            );
            pipeline.status = status;
            self.store.update_pipeline(&pipeline).await?;
            changed = true;
        }

        match failure {
            Some(e) => Err(e),
            None => {
                debug!(pipeline_id = %id, changed, "Stepped pipeline");
                Ok(changed)
            }
        }
    }

    /// Cancel a pipeline and all of its jobs. Returns false when there was
    /// nothing left to cancel.
    pub async fn cancel(&self, id: PipelineId) -> Result<bool> {
        let _guard = self.write_guard(id).await?;

        let mut pipeline = self.load(id).await?;
        if !pipeline.is_active() {
            warn!(
                pipeline_id = %id,
                status = pipeline.status.description(),
                "Pipeline already completed, ignoring cancel"
            );
            return Ok(false);
        }

        pipeline.status = PipelineStatus::Cancelled;
        self.store.update_pipeline(&pipeline).await?;

        let mut jobs = self.store.jobs_for_pipeline(id).await?;
        let mut failure = None;
        for job in jobs.iter_mut() {
            if let Err(e) = self.jobs.cancel(job).await {
                error!(pipeline_id = %id, job = %job.name, error = %e, "Failed to cancel job");
                failure.get_or_insert(e);
            }
            if let Err(e) = self.store.update_job(job).await {
                failure.get_or_insert(e);
            }
        }

        info!(pipeline_id = %id, "Cancelled pipeline");
        self.notify_change().await;

        match failure {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Reclaim a completed pipeline's containers and temporary directory.
    pub async fn cleanup(&self, id: PipelineId) -> Result<()> {
        let guard = self.write_guard(id).await?;

        let mut pipeline = self.load(id).await?;
        if pipeline.cleaned_up {
            return Ok(());
        }
        if !pipeline.is_complete() {
            return Err(Error::PipelineNotComplete(id.to_string()));
        }

        if let Some(Workdir::Temporary(path)) = &pipeline.workdir {
            self.workspace.remove(path)?;
        }

        let mut jobs = self.store.jobs_for_pipeline(id).await?;
        for job in jobs.iter_mut() {
            if !job.is_complete() {
                warn!(job = %job.name, "Cancelling leftover job before cleanup");
                self.jobs.cancel(job).await?;
            }
            self.jobs.release(job).await?;
            self.store.update_job(job).await?;
        }

        pipeline.cleaned_up = true;
        self.store.update_pipeline(&pipeline).await?;
        info!(pipeline_id = %id, pipeline = %pipeline.name, "Cleaned up pipeline");

        drop(guard);
        self.locks.forget(id);
        Ok(())
    }

    /// Cancel a single job.
    pub async fn cancel_job(&self, id: JobId) -> Result<Job> {
        let pipeline_id = self.load_job(id).await?.pipeline_id;
        let _guard = self.write_guard(pipeline_id).await?;

        let mut job = self.load_job(id).await?;
        let before = job.status;
        let result = self.jobs.cancel(&mut job).await;
        self.store.update_job(&job).await?;
        if job.status != before {
            self.notify_change().await;
        }
        result.map(|()| job)
    }

    /// Refresh a single job from its container.
    pub async fn poll_job(&self, id: JobId) -> Result<Job> {
        let pipeline_id = self.load_job(id).await?.pipeline_id;
        let _guard = self.write_guard(pipeline_id).await?;

        let mut job = self.load_job(id).await?;
        let before = job.status;
        let result = self.jobs.update(&mut job).await;
        self.store.update_job(&job).await?;
        if job.status != before {
            self.notify_change().await;
        }
        result.map(|()| job)
    }

    /// Pipeline, jobs and their topological layers.
    pub async fn status(&self, id: PipelineId) -> Result<PipelineView> {
        let pipeline = self.load(id).await?;
        let jobs = self.store.jobs_for_pipeline(id).await?;

        let names: HashMap<JobId, &str> = jobs.iter().map(|j| (j.id, j.name.as_str())).collect();
        let graph = DependencyGraph::build(jobs.iter().map(|job| {
            (
                job.name.clone(),
                job.parents
                    .iter()
                    .filter_map(|p| names.get(p).map(|n| n.to_string()))
                    .collect(),
            )
        }))?;
        let layers = graph.layers()?;

        Ok(PipelineView {
            pipeline,
            jobs,
            layers,
        })
    }
}
