//! In-process PipelineStore for single-node runs and tests.

use async_trait::async_trait;
use fastci_core::ids::{JobId, PipelineId};
use fastci_core::job::Job;
use fastci_core::pipeline::Pipeline;
use fastci_core::ports::{PipelineFilter, PipelineLease, PipelineStore};
use fastci_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

#[derive(Default)]
struct Tables {
    pipelines: Vec<Pipeline>,
    jobs: Vec<Job>,
}

/// Keeps everything in memory, in insertion order.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    leases: Mutex<HashMap<PipelineId, Arc<AsyncMutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn lock_pipeline(&self, id: PipelineId) -> Result<PipelineLease> {
        let lease = {
            let mut leases = self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            leases.entry(id).or_default().clone()
        };
        Ok(PipelineLease::new(lease.lock_owned().await))
    }

    async fn create_pipeline(&self, pipeline: &Pipeline, jobs: &[Job]) -> Result<()> {
        let mut tables = self.tables.write().await;

        if tables.pipelines.iter().any(|p| p.id == pipeline.id) {
            return Err(Error::Database(format!("pipeline {} already exists", pipeline.id)));
        }

        let mut names = HashSet::new();
        let ids: HashSet<JobId> = jobs.iter().map(|j| j.id).collect();
        for job in jobs {
            if job.pipeline_id != pipeline.id {
                return Err(Error::Database(format!(
                    "job '{}' belongs to another pipeline",
                    job.name
                )));
            }
            if !names.insert(job.name.as_str()) {
                return Err(Error::Database(format!(
                    "duplicate job name '{}' in pipeline {}",
                    job.name, pipeline.id
                )));
            }
            if let Some(parent) = job.parents.iter().find(|p| !ids.contains(p)) {
                return Err(Error::Database(format!(
                    "job '{}' references unknown parent {parent}",
                    job.name
                )));
            }
        }

        tables.pipelines.push(pipeline.clone());
        tables.jobs.extend(jobs.iter().cloned());
        Ok(())
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let tables = self.tables.read().await;
        Ok(tables.pipelines.iter().find(|p| p.id == id).cloned())
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .pipelines
            .iter_mut()
            .find(|p| p.id == pipeline.id)
            .ok_or_else(|| Error::PipelineNotFound(pipeline.id.to_string()))?;
        *slot = pipeline.clone();
        Ok(())
    }

    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>> {
        let tables = self.tables.read().await;
        let mut pipelines: Vec<Pipeline> = tables
            .pipelines
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        pipelines.sort_by_key(|p| p.created_at);
        Ok(pipelines)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let tables = self.tables.read().await;
        Ok(tables.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn jobs_for_pipeline(&self, pipeline_id: PipelineId) -> Result<Vec<Job>> {
        let tables = self.tables.read().await;
        Ok(tables
            .jobs
            .iter()
            .filter(|j| j.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| Error::JobNotFound(job.id.to_string()))?;
        *slot = job.clone();
        Ok(())
    }
}
