//! In-process stand-ins for the runtime, notifier and store ports.

use async_trait::async_trait;
use chrono::Utc;
use fastci_core::container::{
    ContainerSpec, ContainerState, ContainerStatus, RuntimeError, RuntimeErrorKind,
};
use fastci_core::ids::{ContainerHandle, JobId, PipelineId};
use fastci_core::job::Job;
use fastci_core::pipeline::Pipeline;
use fastci_core::ports::{
    ChangeNotifier, ContainerRuntime, PipelineFilter, PipelineLease, PipelineStore,
};
use fastci_core::{Error, Result};
use fastci_db::MemoryStore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Runtime operations, for error injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Start,
    Kill,
    Remove,
    Inspect,
    Logs,
}

/// How many times each operation was called.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Calls {
    pub create: usize,
    pub start: usize,
    pub kill: usize,
    pub remove: usize,
    pub inspect: usize,
    pub logs: usize,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub state: ContainerState,
    pub logs: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    calls: Calls,
    failures: HashMap<Op, RuntimeError>,
    fail_create_after: Option<usize>,
}

/// Container runtime that keeps containers in a map. Containers never exit
/// on their own; tests finish them explicitly.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    latency: Mutex<Option<Duration>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake runtime lock poisoned")
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("latency lock poisoned") = Some(latency);
    }

    /// Make the next call of `op` fail with `kind`.
    pub fn fail_next(&self, op: Op, kind: RuntimeErrorKind, message: &str) {
        self.lock()
            .failures
            .insert(op, RuntimeError::new(kind, message));
    }

    /// Let `n` creations succeed, then fail every following one.
    pub fn fail_create_after(&self, n: usize) {
        self.lock().fail_create_after = Some(n);
    }

    /// Mark a container as exited with `exit_code`.
    pub fn finish(&self, handle: &ContainerHandle, exit_code: i64) {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(handle.as_str())
            .expect("finish: unknown container");
        let now = Utc::now();
        container.state.status = ContainerStatus::Exited;
        container.state.exit_code = Some(exit_code);
        container.state.started_at.get_or_insert(now);
        container.state.finished_at = Some(now);
    }

    /// Rewrite what inspect reports for a container.
    pub fn update_state(&self, handle: &ContainerHandle, update: impl FnOnce(&mut ContainerState)) {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(handle.as_str())
            .expect("update_state: unknown container");
        update(&mut container.state);
    }

    /// Drop a container behind the scheduler's back.
    pub fn vanish(&self, handle: &ContainerHandle) {
        self.lock().containers.remove(handle.as_str());
    }

    pub fn set_logs(&self, handle: &ContainerHandle, logs: &[u8]) {
        if let Some(container) = self.lock().containers.get_mut(handle.as_str()) {
            container.logs = logs.to_vec();
        }
    }

    pub fn container(&self, handle: &ContainerHandle) -> Option<FakeContainer> {
        self.lock().containers.get(handle.as_str()).cloned()
    }

    pub fn exists(&self, handle: &ContainerHandle) -> bool {
        self.lock().containers.contains_key(handle.as_str())
    }

    /// Containers that have not been removed.
    pub fn live(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn calls(&self) -> Calls {
        self.lock().calls.clone()
    }

    async fn enter(&self, op: Op) -> std::result::Result<(), RuntimeError> {
        let latency = *self.latency.lock().expect("latency lock poisoned");
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        let calls = &mut state.calls;
        match op {
            Op::Create => calls.create += 1,
            Op::Start => calls.start += 1,
            Op::Kill => calls.kill += 1,
            Op::Remove => calls.remove += 1,
            Op::Inspect => calls.inspect += 1,
            Op::Logs => calls.logs += 1,
        }
        match state.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn missing(handle: &ContainerHandle) -> RuntimeError {
        RuntimeError::not_found(format!("No such container: {handle}"))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> std::result::Result<ContainerHandle, RuntimeError> {
        self.enter(Op::Create).await?;

        let mut state = self.lock();
        if let Some(limit) = state.fail_create_after
            && state.calls.create > limit
        {
            return Err(RuntimeError::new(
                RuntimeErrorKind::Other,
                "daemon unavailable",
            ));
        }

        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: ContainerState::created(),
                logs: Vec::new(),
            },
        );
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> std::result::Result<(), RuntimeError> {
        self.enter(Op::Start).await?;

        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(handle.as_str())
            .ok_or_else(|| Self::missing(handle))?;
        if container.state.status == ContainerStatus::Created {
            container.state.status = ContainerStatus::Running;
            container.state.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> std::result::Result<(), RuntimeError> {
        self.enter(Op::Kill).await?;

        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(handle.as_str())
            .ok_or_else(|| Self::missing(handle))?;
        if container.state.status != ContainerStatus::Running {
            return Err(RuntimeError::new(
                RuntimeErrorKind::Conflict,
                format!("Container {handle} is not running"),
            ));
        }
        container.state.status = ContainerStatus::Exited;
        container.state.exit_code = Some(137);
        container.state.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> std::result::Result<(), RuntimeError> {
        self.enter(Op::Remove).await?;
        self.lock()
            .containers
            .remove(handle.as_str())
            .map(|_| ())
            .ok_or_else(|| Self::missing(handle))
    }

    async fn inspect(
        &self,
        handle: &ContainerHandle,
    ) -> std::result::Result<ContainerState, RuntimeError> {
        self.enter(Op::Inspect).await?;
        self.lock()
            .containers
            .get(handle.as_str())
            .map(|c| c.state.clone())
            .ok_or_else(|| Self::missing(handle))
    }

    async fn logs(&self, handle: &ContainerHandle) -> std::result::Result<Vec<u8>, RuntimeError> {
        self.enter(Op::Logs).await?;
        self.lock()
            .containers
            .get(handle.as_str())
            .map(|c| c.logs.clone())
            .ok_or_else(|| Self::missing(handle))
    }
}

/// Records every published topic.
#[derive(Default)]
pub struct RecordingNotifier {
    topics: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().expect("notifier lock poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.topics.lock().expect("notifier lock poisoned").len()
    }

    pub fn clear(&self) {
        self.topics.lock().expect("notifier lock poisoned").clear();
    }

    /// Make every publish fail from now on.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangeNotifier for RecordingNotifier {
    async fn publish(&self, topic: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Notify("bus unavailable".into()));
        }
        self.topics
            .lock()
            .expect("notifier lock poisoned")
            .push(topic.to_string());
        Ok(())
    }
}

/// MemoryStore with switchable failures.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_create: AtomicBool,
    fail_job_updates_after: Mutex<Option<usize>>,
    job_updates: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Let `n` job updates through, then fail the rest.
    pub fn fail_job_updates_after(&self, n: usize) {
        self.job_updates.store(0, Ordering::SeqCst);
        *self
            .fail_job_updates_after
            .lock()
            .expect("store lock poisoned") = Some(n);
    }
}

#[async_trait]
impl PipelineStore for FailingStore {
    async fn lock_pipeline(&self, id: PipelineId) -> Result<PipelineLease> {
        self.inner.lock_pipeline(id).await
    }

    async fn create_pipeline(&self, pipeline: &Pipeline, jobs: &[Job]) -> Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Database("connection reset".into()));
        }
        self.inner.create_pipeline(pipeline, jobs).await
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        self.inner.get_pipeline(id).await
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        self.inner.update_pipeline(pipeline).await
    }

    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>> {
        self.inner.list_pipelines(filter).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn jobs_for_pipeline(&self, pipeline_id: PipelineId) -> Result<Vec<Job>> {
        self.inner.jobs_for_pipeline(pipeline_id).await
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let limit = *self
            .fail_job_updates_after
            .lock()
            .expect("store lock poisoned");
        let done = self.job_updates.fetch_add(1, Ordering::SeqCst);
        if limit.is_some_and(|limit| done >= limit) {
            return Err(Error::Database("connection reset".into()));
        }
        self.inner.update_job(job).await
    }
}
