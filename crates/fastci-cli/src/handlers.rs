//! Command handlers.

use crate::config::{DaemonConfig, ENV_PREFIX};
use anyhow::Context;
use console::style;
use fastci_core::ids::{JobId, PipelineId};
use fastci_core::job::Job;
use fastci_core::pipeline::PipelineDocument;
use fastci_core::ports::{ChangeNotifier, ContainerRuntime, PipelineStore};
use fastci_db::{Database, MemoryStore};
use fastci_nats::NatsNotifier;
use fastci_runner::DockerRuntime;
use fastci_scheduler::{BroadcastNotifier, DependencyGraph, PipelineEngine, Reconciler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Read a pipeline document; `.yaml`/`.yml` files are parsed as YAML.
pub fn load_document(path: &Path) -> anyhow::Result<PipelineDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let doc: PipelineDocument = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| fastci_core::Error::InvalidDocument(e.to_string()))?
    } else {
        PipelineDocument::from_json(&raw)?
    };
    Ok(doc)
}

async fn connect_store(url: &str) -> anyhow::Result<Arc<dyn PipelineStore>> {
    let db = Database::connect(url).await?;
    db.migrate().await?;
    Ok(Arc::new(db.store()))
}

/// Wire an engine over `store` to the configured notifier and runtime.
async fn build_engine(
    config: &DaemonConfig,
    store: Arc<dyn PipelineStore>,
) -> anyhow::Result<Arc<PipelineEngine>> {
    let notifier: Arc<dyn ChangeNotifier> = match &config.nats_url {
        Some(url) => Arc::new(NatsNotifier::connect(url).await?),
        None => Arc::new(BroadcastNotifier::default()),
    };

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(config.docker_host.as_deref())?);

    Ok(Arc::new(PipelineEngine::new(
        store,
        runtime,
        notifier,
        &config.scheduler,
    )))
}

/// Engine for the daemon, which may keep its pipelines in memory.
async fn daemon_engine(config: &DaemonConfig) -> anyhow::Result<Arc<PipelineEngine>> {
    let store = match &config.database_url {
        Some(url) => connect_store(url).await?,
        None => {
            warn!("No database configured, pipelines are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    build_engine(config, store).await
}

/// Engine for one-shot commands. These act on pipelines owned by a running
/// daemon, so they need the database that daemon uses.
async fn shared_engine(config: &DaemonConfig) -> anyhow::Result<Arc<PipelineEngine>> {
    let url = require_database(config)?;
    let store = connect_store(url).await?;
    build_engine(config, store).await
}

fn require_database(config: &DaemonConfig) -> anyhow::Result<&str> {
    config.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!(
            "No database configured. Set database_url (or {ENV_PREFIX}__DATABASE_URL) to the \
             daemon's database, or submit pipelines with `fastci run --pipeline <FILE>`"
        )
    })
}

fn parse_pipeline_id(raw: &str) -> anyhow::Result<PipelineId> {
    raw.parse()
        .with_context(|| format!("'{raw}' is not a pipeline id"))
}

fn parse_job_id(raw: &str) -> anyhow::Result<JobId> {
    raw.parse().with_context(|| format!("'{raw}' is not a job id"))
}

fn print_job(job: &Job) {
    let status = if job.is_successful() {
        style(job.status.description()).green()
    } else if job.is_failed() {
        style(job.status.description()).red()
    } else {
        style(job.status.description()).yellow()
    };

    println!(
        "  {:<24} {:<18} exit={:<5} uptime={:>8.2}s container={}",
        job.name,
        status,
        job.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into()),
        job.uptime_secs,
        job.container
            .as_ref()
            .map(|c| c.short().to_string())
            .unwrap_or_else(|| "released".into()),
    );
    if !job.error.is_empty() {
        println!("    {} {}", style("error:").red(), job.error);
    }
}

async fn submit(engine: &PipelineEngine, path: &Path) -> anyhow::Result<PipelineId> {
    let doc = load_document(path)?;
    let (pipeline, jobs) = engine.create(&doc).await?;

    println!(
        "{} Created pipeline {} ({}) with {} jobs",
        style("✓").green(),
        style(&pipeline.name).bold(),
        pipeline.id,
        jobs.len()
    );
    for job in &jobs {
        println!("    - {} {}", job.name, style(job.id).dim());
    }
    Ok(pipeline.id)
}

/// Run the reconciler until Ctrl-C.
pub async fn run(config: &DaemonConfig, pipelines: &[PathBuf]) -> anyhow::Result<()> {
    let engine = daemon_engine(config).await?;
    for path in pipelines {
        submit(&engine, path).await?;
    }

    let reconciler = Arc::new(Reconciler::new(engine, &config.scheduler));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    task.await.context("Reconciler task panicked")?;
    Ok(())
}

pub async fn create(config: &DaemonConfig, path: &Path) -> anyhow::Result<()> {
    let engine = shared_engine(config).await?;
    submit(&engine, path).await?;
    Ok(())
}

pub async fn cancel(config: &DaemonConfig, pipeline_id: &str) -> anyhow::Result<()> {
    let id = parse_pipeline_id(pipeline_id)?;
    let engine = shared_engine(config).await?;

    if engine.cancel(id).await? {
        println!("{} Cancelled pipeline {}", style("✓").green(), id);
    } else {
        println!("{} Pipeline {} already completed", style("!").yellow(), id);
    }
    Ok(())
}

pub async fn cancel_job(config: &DaemonConfig, job_id: &str) -> anyhow::Result<()> {
    let id = parse_job_id(job_id)?;
    let engine = shared_engine(config).await?;
    let job = engine.cancel_job(id).await?;
    print_job(&job);
    Ok(())
}

pub async fn poll_job(config: &DaemonConfig, job_id: &str) -> anyhow::Result<()> {
    let id = parse_job_id(job_id)?;
    let engine = shared_engine(config).await?;
    let job = engine.poll_job(id).await?;
    print_job(&job);
    Ok(())
}

pub async fn status(config: &DaemonConfig, pipeline_id: &str, json: bool) -> anyhow::Result<()> {
    let id = parse_pipeline_id(pipeline_id)?;
    let engine = shared_engine(config).await?;
    let view = engine.status(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!(
        "{} {} [{}]{}",
        style("▶").cyan(),
        style(&view.pipeline.name).bold(),
        view.pipeline.status.description(),
        if view.pipeline.cleaned_up { " (cleaned up)" } else { "" }
    );
    for job in &view.jobs {
        print_job(job);
    }
    Ok(())
}

/// Validate a document without touching Docker or the database.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let doc = load_document(path)?;
    doc.validate()?;
    let layers = DependencyGraph::from_document(&doc)
        .map_err(fastci_core::Error::from)?
        .layers()
        .map_err(fastci_core::Error::from)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        doc.name
    );
    println!("  Jobs: {}", doc.jobs.len());
    for (depth, layer) in layers.iter().enumerate() {
        println!("    {}: {}", depth, layer.join(", "));
    }
    Ok(())
}

pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(PipelineDocument);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_and_json_documents_agree() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("p.json");
        let yaml = dir.path().join("p.yaml");

        std::fs::write(
            &json,
            r#"{"name": "p", "jobs": [{"name": "a", "image": "alpine", "command": "true", "timeout_secs": "1.5"}]}"#,
        )
        .unwrap();
        std::fs::write(
            &yaml,
            "name: p\njobs:\n  - name: a\n    image: alpine\n    command: \"true\"\n    timeout_secs: 1.5\n",
        )
        .unwrap();

        assert_eq!(load_document(&json).unwrap(), load_document(&yaml).unwrap());
    }

    #[test]
    fn test_yaml_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("p.yml");
        std::fs::write(&yaml, "name: p\nstages: []\njobs: []\n").unwrap();
        assert!(load_document(&yaml).is_err());
    }

    #[tokio::test]
    async fn test_one_shot_commands_need_a_database() {
        let config = DaemonConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("p.json");
        std::fs::write(
            &json,
            r#"{"name": "p", "jobs": [{"name": "a", "image": "alpine", "command": "true"}]}"#,
        )
        .unwrap();

        let err = create(&config, &json).await.unwrap_err();
        assert!(err.to_string().contains("No database configured"));
        assert!(err.to_string().contains("fastci run --pipeline"));

        let pipeline = PipelineId::new().to_string();
        let job = JobId::new().to_string();
        assert!(cancel(&config, &pipeline).await.is_err());
        assert!(status(&config, &pipeline, false).await.is_err());
        assert!(cancel_job(&config, &job).await.is_err());
        assert!(poll_job(&config, &job).await.is_err());
    }

    #[test]
    fn test_validate_rejects_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("cycle.json");
        std::fs::write(
            &json,
            r#"{"name": "c", "jobs": [
                {"name": "a", "image": "alpine", "command": "true"},
                {"name": "b", "image": "alpine", "command": "true"}
            ], "parents": {"a": ["b"], "b": ["a"]}}"#,
        )
        .unwrap();

        let err = validate(&json).unwrap_err();
        assert!(err.to_string().contains("Cycle"));
    }
}
