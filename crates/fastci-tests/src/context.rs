//! Test context wiring the scheduler to fakes or real services.

use crate::containers::{NatsContainer, PostgresContainer};
use crate::fakes::{FakeRuntime, RecordingNotifier};
use fastci_core::ids::{JobId, PipelineId};
use fastci_core::job::Job;
use fastci_core::pipeline::{Pipeline, PipelineDocument};
use fastci_core::ports::PipelineStore;
use fastci_db::{Database, MemoryStore};
use fastci_nats::NatsNotifier;
use fastci_scheduler::{PipelineEngine, Reconciler, SchedulerConfig, TickReport};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A scheduler over the in-process fakes.
///
/// Temporary working directories are allocated under a private root that is
/// removed when the context is dropped.
pub struct TestContext {
    pub runtime: Arc<FakeRuntime>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<dyn PipelineStore>,
    pub engine: Arc<PipelineEngine>,
    pub reconciler: Reconciler,
    pub config: SchedulerConfig,
    temp_root: TempDir,
}

impl TestContext {
    /// Context over a fresh MemoryStore with default settings.
    pub fn new() -> Self {
        Self::build(Arc::new(MemoryStore::new()), |_| {})
    }

    /// Context over the given store.
    pub fn with_store(store: Arc<dyn PipelineStore>) -> Self {
        Self::build(store, |_| {})
    }

    /// Context with adjusted scheduler settings.
    pub fn with_config(adjust: impl FnOnce(&mut SchedulerConfig)) -> Self {
        Self::build(Arc::new(MemoryStore::new()), adjust)
    }

    fn build(store: Arc<dyn PipelineStore>, adjust: impl FnOnce(&mut SchedulerConfig)) -> Self {
        crate::init_test_logging();

        let temp_root = TempDir::new().expect("Failed to create temp root");
        let mut config = SchedulerConfig::default();
        config.workspace.temp_root = temp_root.path().to_path_buf();
        adjust(&mut config);

        let runtime = Arc::new(FakeRuntime::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Arc::new(PipelineEngine::new(
            store.clone(),
            runtime.clone(),
            notifier.clone(),
            &config,
        ));
        let reconciler = Reconciler::new(engine.clone(), &config);

        Self {
            runtime,
            notifier,
            store,
            engine,
            reconciler,
            config,
            temp_root,
        }
    }

    /// A second engine over the same store, runtime and notifier, standing
    /// in for another process that shares the database.
    pub fn peer_engine(&self) -> PipelineEngine {
        PipelineEngine::new(
            self.store.clone(),
            self.runtime.clone(),
            self.notifier.clone(),
            &self.config,
        )
    }

    pub fn temp_root(&self) -> &Path {
        self.temp_root.path()
    }

    /// Directories currently allocated under the temp root.
    pub fn temp_dirs(&self) -> usize {
        std::fs::read_dir(self.temp_root.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Create a pipeline, panicking on failure.
    pub async fn create(&self, doc: &PipelineDocument) -> (Pipeline, Vec<Job>) {
        self.engine.create(doc).await.expect("Failed to create pipeline")
    }

    pub async fn tick(&self) -> TickReport {
        self.reconciler.tick().await
    }

    pub async fn pipeline(&self, id: PipelineId) -> Pipeline {
        self.store
            .get_pipeline(id)
            .await
            .expect("store failure")
            .expect("pipeline missing")
    }

    pub async fn jobs(&self, id: PipelineId) -> Vec<Job> {
        self.store.jobs_for_pipeline(id).await.expect("store failure")
    }

    /// The job called `name` in pipeline `id`.
    pub async fn job(&self, id: PipelineId, name: &str) -> Job {
        self.jobs(id)
            .await
            .into_iter()
            .find(|j| j.name == name)
            .unwrap_or_else(|| panic!("no job named '{name}'"))
    }

    pub async fn job_by_id(&self, id: JobId) -> Job {
        self.store
            .get_job(id)
            .await
            .expect("store failure")
            .expect("job missing")
    }

    /// Let the container of job `name` exit with `exit_code`.
    pub async fn finish(&self, id: PipelineId, name: &str, exit_code: i64) {
        let job = self.job(id, name).await;
        let handle = job.container.expect("job has no container");
        self.runtime.finish(&handle, exit_code);
    }

    /// Tick until the pipeline completes, finishing every running job with
    /// exit code 0 along the way.
    pub async fn run_to_completion(&self, id: PipelineId) -> Pipeline {
        for _ in 0..32 {
            self.tick().await;
            let pipeline = self.pipeline(id).await;
            if pipeline.is_complete() {
                return pipeline;
            }
            for job in self.jobs(id).await {
                if job.status == fastci_core::job::JobStatus::Running
                    && let Some(handle) = &job.container
                {
                    self.runtime.finish(handle, 0);
                }
            }
        }
        panic!("pipeline {id} did not complete");
    }

    /// Create context with only PostgreSQL.
    pub async fn postgres_only() -> anyhow::Result<PostgresOnlyContext> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = postgres.database().await?;

        Ok(PostgresOnlyContext { postgres, db })
    }

    /// Create context with only NATS.
    pub async fn nats_only() -> anyhow::Result<NatsOnlyContext> {
        crate::init_test_logging();

        let nats = NatsContainer::start().await?;
        let notifier = nats.notifier().await?;

        Ok(NatsOnlyContext { nats, notifier })
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal context with only PostgreSQL.
pub struct PostgresOnlyContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

/// Minimal context with only NATS.
pub struct NatsOnlyContext {
    pub nats: NatsContainer,
    pub notifier: NatsNotifier,
}
