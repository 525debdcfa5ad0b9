//! Job engine: drives a single job's container through its lifecycle.

use chrono::{DateTime, Utc};
use fastci_core::container::{
    ContainerSpec, ContainerState, Mount, RuntimeError, RuntimeErrorKind,
};
use fastci_core::ids::{ContainerHandle, PipelineId};
use fastci_core::job::{Job, JobStatus};
use fastci_core::pipeline::JobSpec;
use fastci_core::ports::ContainerRuntime;
use fastci_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const PIPELINE_LABEL: &str = "fastci.pipeline";
pub const JOB_LABEL: &str = "fastci.job";

/// Seconds a job has been (or was) running.
///
/// Runtime timestamps and the host clock are never mixed: a finished
/// container is measured on the runtime clock, a running one on ours.
pub fn compute_uptime(
    status: JobStatus,
    state: Option<&ContainerState>,
    host_started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    if matches!(status, JobStatus::NotStarted | JobStatus::FailedToStart) {
        return 0.0;
    }

    if let Some(secs) = state.and_then(ContainerState::runtime_duration_secs) {
        return secs.max(0.0);
    }

    if matches!(status, JobStatus::Cancelled | JobStatus::DependencyFailed) {
        return 0.0;
    }

    host_started_at
        .map(|started| (now - started).num_microseconds().unwrap_or(0) as f64 / 1e6)
        .unwrap_or(0.0)
        .max(0.0)
}

/// Job output as text. Invalid UTF-8 is replaced and NUL bytes are dropped,
/// since text columns cannot hold them.
pub fn decode_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.contains('\0') {
        text.replace('\0', "")
    } else {
        text.into_owned()
    }
}

/// Drives job records against the container runtime.
#[derive(Clone)]
pub struct JobEngine {
    runtime: Arc<dyn ContainerRuntime>,
}

impl JobEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Create the job's container without starting it and build its record.
    pub async fn provision(
        &self,
        pipeline_id: PipelineId,
        spec: &JobSpec,
        mounts: Vec<Mount>,
        command: Vec<String>,
    ) -> Result<Job> {
        spec.validate()?;

        let labels = HashMap::from([
            (PIPELINE_LABEL.to_string(), pipeline_id.to_string()),
            (JOB_LABEL.to_string(), spec.name.clone()),
        ]);
        let container = ContainerSpec {
            image: spec.image.clone(),
            command,
            mounts,
            labels,
        };

        let handle = self.runtime.create(&container).await?;
        let job = Job::new(pipeline_id, spec.name.clone(), handle.clone(), spec.timeout_secs);

        if let Err(e) = job.validate() {
            self.discard(&handle).await;
            return Err(e);
        }

        info!(
            pipeline_id = %pipeline_id,
            job = %job.name,
            container = handle.short(),
            image = %spec.image,
            "Provisioned job"
        );
        Ok(job)
    }

    /// Start a NOT_STARTED job's container.
    pub async fn start(&self, job: &mut Job) -> Result<()> {
        if job.status != JobStatus::NotStarted {
            return Err(Error::InvalidTransition {
                from: job.status,
                to: JobStatus::Running,
            });
        }
        let handle = job.container_handle()?.clone();

        if let Err(e) = self.runtime.start(&handle).await {
            return self.record_failure(job, e, JobStatus::FailedToStart);
        }
        let started_at = Utc::now();

        // The first inspect belongs to the start: a rejection here is still
        // a failure to start.
        match self.runtime.inspect(&handle).await {
            Ok(state) => {
                Self::mark_running(job, &handle, started_at)?;
                self.sync(job, &handle, &state).await;
                Ok(())
            }
            Err(e)
                if matches!(e.kind, RuntimeErrorKind::BadRequest | RuntimeErrorKind::NotFound) =>
            {
                self.record_failure(job, e, JobStatus::FailedToStart)
            }
            Err(e) => {
                Self::mark_running(job, &handle, started_at)?;
                Err(e.into())
            }
        }
    }

    fn mark_running(
        job: &mut Job,
        handle: &ContainerHandle,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        job.host_started_at = Some(started_at);
        job.transition(JobStatus::Running)?;
        info!(job = %job.name, container = handle.short(), "Started job");
        Ok(())
    }

    /// Refresh a RUNNING job from its container and enforce its timeout.
    pub async fn update(&self, job: &mut Job) -> Result<()> {
        if job.status != JobStatus::Running {
            return Ok(());
        }
        let handle = job.container_handle()?.clone();

        let mut state = match self.runtime.inspect(&handle).await {
            Ok(state) => state,
            Err(e) => return self.record_failure(job, e, JobStatus::DockerError),
        };

        let uptime = compute_uptime(job.status, Some(&state), job.host_started_at, Utc::now());
        let timed_out = job.timeout_secs.is_some_and(|limit| uptime > limit);

        if timed_out {
            if state.status.has_exited() {
                warn!(
                    job = %job.name,
                    uptime_secs = uptime,
                    "Job finished but exceeded its timeout"
                );
            } else {
                self.kill(job, &handle).await?;
                if let Ok(fresh) = self.runtime.inspect(&handle).await {
                    state = fresh;
                }
            }
            job.transition(JobStatus::TimedOut)?;
            info!(job = %job.name, uptime_secs = uptime, "Job timed out");
        } else if state.status.has_exited() {
            job.transition(JobStatus::Finished)?;
            info!(job = %job.name, exit_code = ?state.exit_code, "Job finished");
        }

        self.sync(job, &handle, &state).await;
        Ok(())
    }

    /// Cancel a job that has not completed yet.
    pub async fn cancel(&self, job: &mut Job) -> Result<()> {
        match job.status {
            JobStatus::NotStarted => {
                job.transition(JobStatus::Cancelled)?;
                job.uptime_secs = 0.0;
                info!(job = %job.name, "Cancelled job before start");
                Ok(())
            }
            JobStatus::Running => {
                let handle = job.container_handle()?.clone();
                self.kill(job, &handle).await?;
                job.transition(JobStatus::Cancelled)?;
                info!(job = %job.name, container = handle.short(), "Cancelled running job");

                match self.runtime.inspect(&handle).await {
                    Ok(state) => self.sync(job, &handle, &state).await,
                    Err(e) => warn!(job = %job.name, error = %e, "Could not inspect cancelled job"),
                }
                Ok(())
            }
            status => {
                warn!(
                    job = %job.name,
                    status = status.description(),
                    "Ignoring cancel of a completed job"
                );
                Ok(())
            }
        }
    }

    /// Current uptime, asking the runtime when the record alone is not enough.
    pub async fn uptime(&self, job: &Job) -> Result<f64> {
        if matches!(job.status, JobStatus::NotStarted | JobStatus::FailedToStart) {
            return Ok(0.0);
        }
        let Some(handle) = &job.container else {
            return Ok(job.uptime_secs);
        };

        let state = self.runtime.inspect(handle).await?;
        Ok(compute_uptime(
            job.status,
            Some(&state),
            job.host_started_at,
            Utc::now(),
        ))
    }

    /// Remove a completed job's container and forget its handle.
    pub async fn release(&self, job: &mut Job) -> Result<()> {
        if !job.is_complete() {
            return Err(Error::JobNotComplete(job.name.clone()));
        }
        let Some(handle) = job.container.take() else {
            return Ok(());
        };

        match self.runtime.remove(&handle).await {
            Ok(()) => {
                debug!(job = %job.name, container = handle.short(), "Released container");
                Ok(())
            }
            Err(e) if e.kind == RuntimeErrorKind::NotFound => {
                warn!(job = %job.name, container = handle.short(), "Container already removed");
                Ok(())
            }
            Err(e) => {
                job.container = Some(handle);
                Err(e.into())
            }
        }
    }

    /// Best-effort removal for rollback paths.
    pub async fn discard(&self, handle: &ContainerHandle) {
        if let Err(e) = self.runtime.remove(handle).await {
            warn!(container = handle.short(), error = %e, "Failed to discard container");
        }
    }

    /// Kill the container; "not running" is fine, "gone" is not.
    async fn kill(&self, job: &mut Job, handle: &ContainerHandle) -> Result<()> {
        match self.runtime.kill(handle).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind == RuntimeErrorKind::Conflict => {
                warn!(job = %job.name, error = %e, "Container was not running when killed");
                Ok(())
            }
            Err(e) => {
                let status = job.status;
                self.record_failure(job, e, status)
            }
        }
    }

    /// Map a runtime error onto the job. Bad requests are recorded with
    /// `on_bad_request`; a vanished container becomes NOT_FOUND and is fatal.
    fn record_failure(
        &self,
        job: &mut Job,
        err: RuntimeError,
        on_bad_request: JobStatus,
    ) -> Result<()> {
        match err.kind {
            RuntimeErrorKind::BadRequest if on_bad_request != job.status => {
                warn!(job = %job.name, error = %err, "Runtime rejected job");
                job.set_error(&err.message);
                job.transition(on_bad_request)?;
                Ok(())
            }
            RuntimeErrorKind::NotFound => {
                error!(job = %job.name, error = %err, "Job container disappeared");
                job.set_error(&err.message);
                job.transition(JobStatus::NotFound)?;
                Err(Error::ContainerNotFound {
                    job: job.name.clone(),
                    message: err.message,
                })
            }
            _ => Err(err.into()),
        }
    }

    /// Copy what the runtime reports onto the record.
    async fn sync(&self, job: &mut Job, handle: &ContainerHandle, state: &ContainerState) {
        job.uptime_secs = compute_uptime(job.status, Some(state), job.host_started_at, Utc::now());
        if !state.error.is_empty() {
            job.set_error(&state.error);
        }
        if job.status == JobStatus::Finished {
            job.exit_code = state.exit_code;
        }

        match self.runtime.logs(handle).await {
            Ok(bytes) => job.output = decode_output(&bytes),
            Err(e) => warn!(job = %job.name, error = %e, "Failed to read job output"),
        }
    }
}
