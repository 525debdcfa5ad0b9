//! Pipeline engine tests: creation, stepping, cancellation and cleanup.

use fastci_core::Error;
use fastci_core::container::RuntimeErrorKind;
use fastci_core::job::JobStatus;
use fastci_core::pipeline::{PipelineStatus, Workdir};
use fastci_core::ports::{PipelineFilter, PipelineStore};
use fastci_tests::{DocumentFixture, FailingStore, Op, TestContext};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_create_provisions_every_job() {
    let ctx = TestContext::new();
    let (pipeline, jobs) = ctx.create(&DocumentFixture::chain()).await;

    assert_eq!(pipeline.status, PipelineStatus::NotStarted);
    assert!(pipeline.workdir.is_none());
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.status == JobStatus::NotStarted));
    assert_eq!(ctx.runtime.live(), 3);
    assert_eq!(ctx.runtime.calls().start, 0);

    let build = ctx.job(pipeline.id, "build").await;
    let test = ctx.job(pipeline.id, "test").await;
    let deploy = ctx.job(pipeline.id, "deploy").await;
    assert!(build.parents.is_empty());
    assert_eq!(test.parents, vec![build.id]);
    assert_eq!(deploy.parents, vec![test.id]);
    assert_eq!(ctx.temp_dirs(), 0);
}

#[tokio::test]
async fn test_shared_workdir_is_mounted_into_every_job() {
    let ctx = TestContext::new();
    let (pipeline, jobs) = ctx.create(&DocumentFixture::shared_workdir()).await;

    let Some(Workdir::Temporary(path)) = &pipeline.workdir else {
        panic!("expected a temporary workdir, got {:?}", pipeline.workdir);
    };
    assert!(path.is_dir());
    assert!(path.starts_with(ctx.temp_root()));
    assert_eq!(ctx.temp_dirs(), 1);

    for job in &jobs {
        let container = ctx.runtime.container(job.container.as_ref().unwrap()).unwrap();
        let mount = container
            .spec
            .mounts
            .iter()
            .find(|m| m.target == ctx.config.workspace.pipeline_mount)
            .expect("workdir mount");
        assert_eq!(mount.source, path.display().to_string());
        assert!(!mount.read_only);
    }
}

#[tokio::test]
async fn test_bound_workdir_is_not_allocated() {
    let ctx = TestContext::new();
    let host = tempfile::TempDir::new().unwrap();
    let (pipeline, _) = ctx
        .create(&DocumentFixture::bound_workdir(host.path().to_path_buf()))
        .await;

    assert_eq!(pipeline.workdir, Some(Workdir::Bound(host.path().to_path_buf())));
    assert_eq!(ctx.temp_dirs(), 0);

    ctx.run_to_completion(pipeline.id).await;
    ctx.engine.cleanup(pipeline.id).await.unwrap();
    assert!(host.path().is_dir());
}

#[tokio::test]
async fn test_repo_jobs_run_through_bootstrap() {
    let ctx = TestContext::new();
    let doc = DocumentFixture::repo();
    let (pipeline, jobs) = ctx.create(&doc).await;

    assert!(matches!(pipeline.workdir, Some(Workdir::Temporary(_))));
    let repo = pipeline.repo.clone().unwrap();

    let container = ctx.runtime.container(jobs[0].container.as_ref().unwrap()).unwrap();
    let workspace = &ctx.config.workspace;
    assert_eq!(
        container.spec.command,
        vec![
            workspace.interpreter.clone(),
            workspace.bootstrap_mount.clone(),
            repo.url,
            repo.commit,
            "sh".to_string(),
            "-c".to_string(),
            doc.jobs[0].command.clone(),
        ]
    );
    let script = container
        .spec
        .mounts
        .iter()
        .find(|m| m.target == workspace.bootstrap_mount)
        .expect("bootstrap mount");
    assert!(script.read_only);
}

#[tokio::test]
async fn test_invalid_documents_have_no_side_effects() {
    let ctx = TestContext::new();

    let mut duplicate = DocumentFixture::chain();
    duplicate.jobs[2].name = "build".to_string();
    duplicate.parents.clear();
    let err = ctx.engine.create(&duplicate).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateJobName(ref name) if name == "build"));

    let cycle = DocumentFixture::with_edges("cycle", &["a", "b"], &[("a", "b"), ("b", "a")]);
    let err = ctx.engine.create(&cycle).await.unwrap_err();
    assert!(matches!(err, Error::CycleDetected(_)));

    let mut half_repo = DocumentFixture::single();
    half_repo.repo_url = Some("https://example.com/x.git".to_string());
    let err = ctx.engine.create(&half_repo).await.unwrap_err();
    assert!(matches!(err, Error::IncompleteRepoSource));

    assert_eq!(ctx.runtime.calls().create, 0);
    assert_eq!(ctx.temp_dirs(), 0);
    assert!(ctx.store.list_pipelines(&PipelineFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_runtime_failure_rolls_back_creation() {
    let ctx = TestContext::new();
    ctx.runtime.fail_create_after(1);

    let err = ctx.engine.create(&DocumentFixture::shared_workdir()).await.unwrap_err();

    assert!(matches!(err, Error::Runtime(_)));
    assert_eq!(ctx.runtime.live(), 0);
    assert_eq!(ctx.temp_dirs(), 0);
    assert!(ctx.store.list_pipelines(&PipelineFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_failure_rolls_back_creation() {
    let store = Arc::new(FailingStore::new());
    store.fail_create(true);
    let ctx = TestContext::with_store(store.clone());

    let err = ctx.engine.create(&DocumentFixture::shared_workdir()).await.unwrap_err();

    assert!(matches!(err, Error::Database(_)));
    assert_eq!(ctx.runtime.calls().create, 3);
    assert_eq!(ctx.runtime.live(), 0);
    assert_eq!(ctx.temp_dirs(), 0);
}

#[tokio::test]
async fn test_chain_runs_in_order() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::chain()).await;
    let id = pipeline.id;

    assert!(ctx.engine.step(id).await.unwrap());
    assert_eq!(ctx.pipeline(id).await.status, PipelineStatus::Running);
    assert_eq!(ctx.job(id, "build").await.status, JobStatus::Running);
    assert_eq!(ctx.job(id, "test").await.status, JobStatus::NotStarted);

    ctx.finish(id, "build", 0).await;
    assert!(ctx.engine.step(id).await.unwrap());
    assert_eq!(ctx.job(id, "build").await.status, JobStatus::Finished);
    // Children only see a parent's outcome on the following step.
    assert_eq!(ctx.job(id, "test").await.status, JobStatus::NotStarted);

    assert!(ctx.engine.step(id).await.unwrap());
    assert_eq!(ctx.job(id, "test").await.status, JobStatus::Running);
    assert_eq!(ctx.job(id, "deploy").await.status, JobStatus::NotStarted);

    let done = ctx.run_to_completion(id).await;
    assert_eq!(done.status, PipelineStatus::Finished);
    assert!(ctx.jobs(id).await.iter().all(|j| j.is_successful()));
}

#[tokio::test]
async fn test_step_without_progress_reports_no_change() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::single()).await;

    assert!(ctx.engine.step(pipeline.id).await.unwrap());
    assert!(!ctx.engine.step(pipeline.id).await.unwrap());
    assert_eq!(ctx.runtime.calls().start, 1);
}

#[tokio::test]
async fn test_failed_parent_cascades() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::fan_out()).await;
    let id = pipeline.id;

    ctx.engine.step(id).await.unwrap();
    ctx.finish(id, "a", 1).await;
    ctx.engine.step(id).await.unwrap();
    assert_eq!(ctx.job(id, "a").await.status, JobStatus::Finished);

    ctx.engine.step(id).await.unwrap();
    assert_eq!(ctx.job(id, "b").await.status, JobStatus::DependencyFailed);
    assert_eq!(ctx.job(id, "c").await.status, JobStatus::DependencyFailed);
    assert_eq!(ctx.pipeline(id).await.status, PipelineStatus::Failed);
    assert_eq!(ctx.runtime.calls().start, 1);
}

#[tokio::test]
async fn test_diamond_waits_for_both_parents() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::diamond()).await;
    let id = pipeline.id;

    ctx.engine.step(id).await.unwrap();
    ctx.finish(id, "fetch", 0).await;
    ctx.engine.step(id).await.unwrap();
    ctx.engine.step(id).await.unwrap();
    assert_eq!(ctx.job(id, "lint").await.status, JobStatus::Running);
    assert_eq!(ctx.job(id, "test").await.status, JobStatus::Running);

    ctx.finish(id, "lint", 0).await;
    ctx.engine.step(id).await.unwrap();
    ctx.engine.step(id).await.unwrap();
    assert_eq!(ctx.job(id, "report").await.status, JobStatus::NotStarted);

    ctx.finish(id, "test", 0).await;
    ctx.engine.step(id).await.unwrap();
    ctx.engine.step(id).await.unwrap();
    assert_eq!(ctx.job(id, "report").await.status, JobStatus::Running);
}

#[tokio::test]
async fn test_timeout_fails_pipeline() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::with_timeout(1.0)).await;
    let id = pipeline.id;

    ctx.engine.step(id).await.unwrap();
    let mut job = ctx.job(id, "build").await;
    job.host_started_at = job.host_started_at.map(|t| t - chrono::Duration::seconds(2));
    ctx.store.update_job(&job).await.unwrap();

    ctx.engine.step(id).await.unwrap();

    assert_eq!(ctx.job(id, "build").await.status, JobStatus::TimedOut);
    assert_eq!(ctx.pipeline(id).await.status, PipelineStatus::Failed);
    assert_eq!(ctx.runtime.calls().kill, 1);
}

#[tokio::test]
async fn test_rejected_start_fails_pipeline() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::single()).await;
    ctx.runtime
        .fail_next(Op::Start, RuntimeErrorKind::BadRequest, "invalid entrypoint");

    assert!(ctx.engine.step(pipeline.id).await.unwrap());

    let job = ctx.job(pipeline.id, "build").await;
    assert_eq!(job.status, JobStatus::FailedToStart);
    assert_eq!(job.error, "invalid entrypoint");
    assert_eq!(ctx.pipeline(pipeline.id).await.status, PipelineStatus::Failed);
}

#[tokio::test]
async fn test_vanished_container_is_persisted_then_raised() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::single()).await;
    ctx.engine.step(pipeline.id).await.unwrap();

    let job = ctx.job(pipeline.id, "build").await;
    ctx.runtime.vanish(job.container.as_ref().unwrap());

    let err = ctx.engine.step(pipeline.id).await.unwrap_err();
    assert!(matches!(err, Error::ContainerNotFound { .. }));
    assert_eq!(ctx.job(pipeline.id, "build").await.status, JobStatus::NotFound);
    assert_eq!(ctx.pipeline(pipeline.id).await.status, PipelineStatus::Failed);
}

#[tokio::test]
async fn test_cancel_stops_everything() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::chain()).await;
    let id = pipeline.id;
    ctx.engine.step(id).await.unwrap();

    assert!(ctx.engine.cancel(id).await.unwrap());

    assert_eq!(ctx.pipeline(id).await.status, PipelineStatus::Cancelled);
    for job in ctx.jobs(id).await {
        assert_eq!(job.status, JobStatus::Cancelled, "job {}", job.name);
    }
    assert_eq!(ctx.job(id, "test").await.uptime_secs, 0.0);
    assert_eq!(ctx.runtime.calls().kill, 1);
    assert_eq!(ctx.notifier.count(), 1);

    // Nothing left to cancel, and stepping is a no-op.
    assert!(!ctx.engine.cancel(id).await.unwrap());
    assert!(!ctx.engine.step(id).await.unwrap());
    assert_eq!(ctx.notifier.count(), 1);
}

#[tokio::test]
async fn test_cleanup_requires_completion() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::single()).await;

    let err = ctx.engine.cleanup(pipeline.id).await.unwrap_err();
    assert!(matches!(err, Error::PipelineNotComplete(_)));
    assert_eq!(ctx.runtime.live(), 1);
}

#[tokio::test]
async fn test_cleanup_reclaims_resources_once() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::shared_workdir()).await;
    let id = pipeline.id;
    ctx.run_to_completion(id).await;
    assert_eq!(ctx.temp_dirs(), 1);

    ctx.engine.cleanup(id).await.unwrap();

    let cleaned = ctx.pipeline(id).await;
    assert!(cleaned.cleaned_up);
    assert_eq!(cleaned.status, PipelineStatus::Finished);
    assert_eq!(ctx.temp_dirs(), 0);
    assert_eq!(ctx.runtime.live(), 0);
    assert!(ctx.jobs(id).await.iter().all(|j| j.container.is_none()));

    let removes = ctx.runtime.calls().remove;
    ctx.engine.cleanup(id).await.unwrap();
    assert_eq!(ctx.runtime.calls().remove, removes);
}

#[tokio::test]
async fn test_cancelled_pipeline_can_be_cleaned_up() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::shared_workdir()).await;
    ctx.engine.step(pipeline.id).await.unwrap();
    ctx.engine.cancel(pipeline.id).await.unwrap();

    ctx.engine.cleanup(pipeline.id).await.unwrap();
    assert_eq!(ctx.runtime.live(), 0);
    assert_eq!(ctx.temp_dirs(), 0);
}

#[tokio::test]
async fn test_single_job_cancel_and_poll() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::fan_out()).await;
    let id = pipeline.id;
    ctx.engine.step(id).await.unwrap();

    let b = ctx.job(id, "b").await;
    let cancelled = ctx.engine.cancel_job(b.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(ctx.job_by_id(b.id).await.status, JobStatus::Cancelled);
    assert_eq!(ctx.notifier.count(), 1);

    let a = ctx.job(id, "a").await;
    let polled = ctx.engine.poll_job(a.id).await.unwrap();
    assert_eq!(polled.status, JobStatus::Running);
    assert_eq!(ctx.notifier.count(), 1);

    ctx.finish(id, "a", 0).await;
    let polled = ctx.engine.poll_job(a.id).await.unwrap();
    assert_eq!(polled.status, JobStatus::Finished);
    assert_eq!(ctx.notifier.count(), 2);
}

#[tokio::test]
async fn test_cancel_job_waits_for_in_flight_step() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::single()).await;
    let id = pipeline.id;
    ctx.engine.step(id).await.unwrap();
    ctx.finish(id, "build", 0).await;
    let build = ctx.job(id, "build").await;
    ctx.runtime.set_latency(Duration::from_millis(50));

    let cancel = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.engine.cancel_job(build.id).await
    };
    let (stepped, cancelled) = tokio::join!(ctx.engine.step(id), cancel);

    assert!(stepped.unwrap());
    assert_eq!(cancelled.unwrap().status, JobStatus::Finished);
    assert_eq!(ctx.job_by_id(build.id).await.status, JobStatus::Finished);
    assert_eq!(ctx.pipeline(id).await.status, PipelineStatus::Finished);
    assert_eq!(ctx.runtime.calls().kill, 0);
}

#[tokio::test]
async fn test_poll_job_waits_for_in_flight_cancel() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::single()).await;
    let id = pipeline.id;
    ctx.engine.step(id).await.unwrap();
    let build = ctx.job(id, "build").await;
    ctx.runtime.set_latency(Duration::from_millis(50));

    let poll = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.engine.poll_job(build.id).await
    };
    let (cancelled, polled) = tokio::join!(ctx.engine.cancel(id), poll);

    assert!(cancelled.unwrap());
    assert_eq!(polled.unwrap().status, JobStatus::Cancelled);
    assert_eq!(ctx.pipeline(id).await.status, PipelineStatus::Cancelled);
    assert_eq!(ctx.job_by_id(build.id).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_engines_sharing_a_store_serialize_writes() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::single()).await;
    let id = pipeline.id;
    ctx.engine.step(id).await.unwrap();
    ctx.finish(id, "build", 0).await;
    ctx.runtime.set_latency(Duration::from_millis(50));

    let other = ctx.peer_engine();
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        other.cancel(id).await
    };
    let (stepped, cancelled) = tokio::join!(ctx.engine.step(id), cancel);

    assert!(stepped.unwrap());
    assert!(!cancelled.unwrap());
    assert_eq!(ctx.pipeline(id).await.status, PipelineStatus::Finished);
    assert_eq!(ctx.job(id, "build").await.status, JobStatus::Finished);
}

#[tokio::test]
async fn test_status_view_layers() {
    let ctx = TestContext::new();
    let (pipeline, _) = ctx.create(&DocumentFixture::diamond()).await;

    let view = ctx.engine.status(pipeline.id).await.unwrap();

    assert_eq!(view.pipeline.id, pipeline.id);
    assert_eq!(view.jobs.len(), 4);
    assert_eq!(
        view.layers,
        vec![
            vec!["fetch".to_string()],
            vec!["lint".to_string(), "test".to_string()],
            vec!["report".to_string()],
        ]
    );
}

#[tokio::test]
async fn test_unknown_ids_are_reported() {
    let ctx = TestContext::new();
    let err = ctx
        .engine
        .step(fastci_core::PipelineId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PipelineNotFound(_)));

    let err = ctx
        .engine
        .poll_job(fastci_core::JobId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobNotFound(_)));
}
