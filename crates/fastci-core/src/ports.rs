//! Port traits.
//!
//! These traits define the interfaces between the scheduler and its adapters:
//! the container runtime, the record store and the change notifier.

use crate::container::{ContainerSpec, ContainerState, RuntimeError};
use crate::ids::*;
use crate::job::Job;
use crate::pipeline::{Pipeline, PipelineStatus};
use crate::Result;
use async_trait::async_trait;
use std::any::Any;

/// Topic published to when any job or pipeline changed during a tick.
pub const DEFAULT_NOTIFY_TOPIC: &str = "pipeline-job-state-change";

/// Container lifecycle operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container without starting it.
    async fn create(&self, spec: &ContainerSpec) -> std::result::Result<ContainerHandle, RuntimeError>;

    async fn start(&self, handle: &ContainerHandle) -> std::result::Result<(), RuntimeError>;

    /// Send SIGKILL. A container that is not running yields a conflict.
    async fn kill(&self, handle: &ContainerHandle) -> std::result::Result<(), RuntimeError>;

    /// Force-remove the container.
    async fn remove(&self, handle: &ContainerHandle) -> std::result::Result<(), RuntimeError>;

    async fn inspect(
        &self,
        handle: &ContainerHandle,
    ) -> std::result::Result<ContainerState, RuntimeError>;

    /// Combined stdout and stderr.
    async fn logs(&self, handle: &ContainerHandle) -> std::result::Result<Vec<u8>, RuntimeError>;
}

/// Selection used when listing pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelineFilter {
    /// Empty means any status.
    pub statuses: Vec<PipelineStatus>,
    pub cleaned_up: Option<bool>,
}

impl PipelineFilter {
    /// Pipelines the reconciler still has to step.
    pub fn active() -> Self {
        Self {
            statuses: PipelineStatus::ACTIVE.to_vec(),
            cleaned_up: Some(false),
        }
    }

    /// Completed pipelines whose resources are still held.
    pub fn awaiting_cleanup() -> Self {
        Self {
            statuses: PipelineStatus::COMPLETE.to_vec(),
            cleaned_up: Some(false),
        }
    }

    pub fn matches(&self, pipeline: &Pipeline) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&pipeline.status))
            && self.cleaned_up.is_none_or(|c| c == pipeline.cleaned_up)
    }
}

/// Exclusive write access to one pipeline, shared by every engine that uses
/// the same store. Released on drop.
pub struct PipelineLease {
    _held: Box<dyn Any + Send>,
}

impl PipelineLease {
    /// Wrap whatever keeps the lock held: a mutex guard, an open transaction.
    pub fn new(held: impl Any + Send) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for PipelineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLease").finish_non_exhaustive()
    }
}

/// Persistence for pipelines and their jobs.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Wait for the write lease on a pipeline. Every writer of a pipeline's
    /// status or its jobs holds it, whichever process it runs in.
    async fn lock_pipeline(&self, id: PipelineId) -> Result<PipelineLease>;

    /// Store a pipeline with all of its jobs and parent edges, or nothing.
    async fn create_pipeline(&self, pipeline: &Pipeline, jobs: &[Job]) -> Result<()>;

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()>;

    /// Matching pipelines, oldest first.
    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Jobs of a pipeline in creation order.
    async fn jobs_for_pipeline(&self, pipeline_id: PipelineId) -> Result<Vec<Job>>;

    async fn update_job(&self, job: &Job) -> Result<()>;
}

/// "Something changed" signal for observers.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn publish(&self, topic: &str) -> Result<()>;
}
