//! PostgreSQL implementation of PipelineStore.

use async_trait::async_trait;
use fastci_core::ids::{ContainerHandle, JobId, PipelineId};
use fastci_core::job::{Job, JobStatus};
use fastci_core::pipeline::{Pipeline, PipelineStatus, RepoSource, Workdir};
use fastci_core::ports::{PipelineFilter, PipelineLease, PipelineStore};
use fastci_core::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::path::PathBuf;
use tracing::debug;

const PIPELINE_COLUMNS: &str = "id, name, status, workdir_path, workdir_temporary, repo_url, commit_hash, cleaned_up, created_at";

const JOB_COLUMNS: &str = "id, pipeline_id, name, container_id, timeout_secs, status, error, exit_code, output, host_started_at, uptime_secs, \
     ARRAY(SELECT parent_id FROM job_parents WHERE child_id = jobs.id ORDER BY ordinal) AS parents";

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

/// Advisory lock key of a pipeline: the random low half of its uuid.
fn lease_key(id: PipelineId) -> i64 {
    id.as_uuid().as_u128() as u64 as i64
}

/// PostgreSQL implementation of PipelineStore.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PgStore.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_pipeline(r: &PgRow) -> Result<Pipeline> {
        let code: i16 = r.get("status");
        let status = PipelineStatus::from_code(code)
            .ok_or_else(|| Error::Database(format!("unknown pipeline status code {code}")))?;

        let workdir = r
            .get::<Option<String>, _>("workdir_path")
            .map(PathBuf::from)
            .map(|path| {
                if r.get::<bool, _>("workdir_temporary") {
                    Workdir::Temporary(path)
                } else {
                    Workdir::Bound(path)
                }
            });

        let repo = match (
            r.get::<Option<String>, _>("repo_url"),
            r.get::<Option<String>, _>("commit_hash"),
        ) {
            (Some(url), Some(commit)) => Some(RepoSource { url, commit }),
            _ => None,
        };

        Ok(Pipeline {
            id: PipelineId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            name: r.get("name"),
            status,
            workdir,
            repo,
            cleaned_up: r.get("cleaned_up"),
            created_at: r.get("created_at"),
        })
    }

    fn row_to_job(r: &PgRow) -> Result<Job> {
        let code: i16 = r.get("status");
        let status = JobStatus::from_code(code)
            .ok_or_else(|| Error::Database(format!("unknown job status code {code}")))?;

        Ok(Job {
            id: JobId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            pipeline_id: PipelineId::from_uuid(r.get::<uuid::Uuid, _>("pipeline_id")),
            name: r.get("name"),
            container: r
                .get::<Option<String>, _>("container_id")
                .map(ContainerHandle::new),
            timeout_secs: r.get("timeout_secs"),
            status,
            error: r.get("error"),
            exit_code: r.get("exit_code"),
            output: r.get("output"),
            host_started_at: r.get("host_started_at"),
            uptime_secs: r.get("uptime_secs"),
            parents: r
                .get::<Vec<uuid::Uuid>, _>("parents")
                .into_iter()
                .map(JobId::from_uuid)
                .collect(),
        })
    }

    fn workdir_columns(pipeline: &Pipeline) -> (Option<String>, bool) {
        match &pipeline.workdir {
            Some(Workdir::Temporary(path)) => (Some(path.display().to_string()), true),
            Some(Workdir::Bound(path)) => (Some(path.display().to_string()), false),
            None => (None, false),
        }
    }
}

#[async_trait]
impl PipelineStore for PgStore {
    /// Holds `pg_advisory_xact_lock` in an open transaction; dropping the
    /// lease rolls it back, which releases the lock.
    async fn lock_pipeline(&self, id: PipelineId) -> Result<PipelineLease> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lease_key(id))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Ok(PipelineLease::new(tx))
    }

    async fn create_pipeline(&self, pipeline: &Pipeline, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (workdir_path, workdir_temporary) = Self::workdir_columns(pipeline);

        sqlx::query(
            r#"INSERT INTO pipelines (id, name, status, workdir_path, workdir_temporary, repo_url, commit_hash, cleaned_up, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(pipeline.id.as_uuid())
        .bind(&pipeline.name)
        .bind(pipeline.status.code())
        .bind(workdir_path)
        .bind(workdir_temporary)
        .bind(pipeline.repo.as_ref().map(|r| r.url.as_str()))
        .bind(pipeline.repo.as_ref().map(|r| r.commit.as_str()))
        .bind(pipeline.cleaned_up)
        .bind(pipeline.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for (position, job) in jobs.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO jobs (id, pipeline_id, position, name, container_id, timeout_secs, status, error, exit_code, output, host_started_at, uptime_secs)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
            )
            .bind(job.id.as_uuid())
            .bind(job.pipeline_id.as_uuid())
            .bind(position as i32)
            .bind(&job.name)
            .bind(job.container.as_ref().map(|c| c.as_str()))
            .bind(job.timeout_secs)
            .bind(job.status.code())
            .bind(&job.error)
            .bind(job.exit_code)
            .bind(&job.output)
            .bind(job.host_started_at)
            .bind(job.uptime_secs)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for job in jobs {
            for (ordinal, parent) in job.parents.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO job_parents (child_id, parent_id, ordinal) VALUES ($1, $2, $3)",
                )
                .bind(job.id.as_uuid())
                .bind(parent.as_uuid())
                .bind(ordinal as i32)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        debug!(pipeline_id = %pipeline.id, jobs = jobs.len(), "Stored pipeline");
        Ok(())
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let row = sqlx::query(&format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let (workdir_path, workdir_temporary) = Self::workdir_columns(pipeline);

        let result = sqlx::query(
            "UPDATE pipelines SET status = $2, workdir_path = $3, workdir_temporary = $4, cleaned_up = $5, updated_at = NOW() WHERE id = $1",
        )
        .bind(pipeline.id.as_uuid())
        .bind(pipeline.status.code())
        .bind(workdir_path)
        .bind(workdir_temporary)
        .bind(pipeline.cleaned_up)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::PipelineNotFound(pipeline.id.to_string()));
        }
        Ok(())
    }

    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>> {
        let statuses: Option<Vec<i16>> = (!filter.statuses.is_empty())
            .then(|| filter.statuses.iter().map(|s| s.code()).collect());

        let rows = sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines \
             WHERE ($1::smallint[] IS NULL OR status = ANY($1)) \
               AND ($2::boolean IS NULL OR cleaned_up = $2) \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(statuses)
        .bind(filter.cleaned_up)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_pipeline).collect()
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn jobs_for_pipeline(&self, pipeline_id: PipelineId) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE pipeline_id = $1 ORDER BY position ASC"
        ))
        .bind(pipeline_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET container_id = $2, status = $3, error = $4, exit_code = $5, output = $6, host_started_at = $7, uptime_secs = $8, updated_at = NOW() WHERE id = $1",
        )
        .bind(job.id.as_uuid())
        .bind(job.container.as_ref().map(|c| c.as_str()))
        .bind(job.status.code())
        .bind(&job.error)
        .bind(job.exit_code)
        .bind(&job.output)
        .bind(job.host_started_at)
        .bind(job.uptime_secs)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job.id.to_string()));
        }
        Ok(())
    }
}
