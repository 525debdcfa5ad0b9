//! Periodic reconciliation of pipelines against the container runtime.

use crate::config::SchedulerConfig;
use crate::pipeline::PipelineEngine;
use fastci_core::ports::PipelineFilter;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Another tick was still running.
    pub skipped: bool,
    pub stepped: usize,
    pub changed: bool,
    pub notified: bool,
    pub cleaned: usize,
    pub errors: usize,
}

pub struct Reconciler {
    engine: Arc<PipelineEngine>,
    retention: usize,
    tick_interval: Duration,
    in_flight: Mutex<()>,
}

impl Reconciler {
    pub fn new(engine: Arc<PipelineEngine>, config: &SchedulerConfig) -> Self {
        Self {
            engine,
            retention: config.retention,
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            in_flight: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    /// Step every active pipeline, notify once if anything changed, then
    /// clean up completed pipelines beyond the retention window.
    pub async fn tick(&self) -> TickReport {
        let Ok(_flight) = self.in_flight.try_lock() else {
            debug!("Previous tick still running, skipping");
            return TickReport {
                skipped: true,
                ..Default::default()
            };
        };

        let mut report = TickReport::default();
        let store = self.engine.store();

        match store.list_pipelines(&PipelineFilter::active()).await {
            Ok(pipelines) => {
                for pipeline in pipelines {
                    report.stepped += 1;
                    match self.engine.step(pipeline.id).await {
                        Ok(changed) => report.changed |= changed,
                        Err(e) => {
                            // State may have been persisted before the failure.
                            error!(pipeline_id = %pipeline.id, error = %e, "Failed to step pipeline");
                            report.errors += 1;
                            report.changed = true;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to list active pipelines");
                report.errors += 1;
            }
        }

        if report.changed {
            self.engine.notify_change().await;
            report.notified = true;
        }

        match store.list_pipelines(&PipelineFilter::awaiting_cleanup()).await {
            Ok(completed) => {
                let expired = completed.len().saturating_sub(self.retention);
                for pipeline in completed.into_iter().take(expired) {
                    match self.engine.cleanup(pipeline.id).await {
                        Ok(()) => report.cleaned += 1,
                        Err(e) => {
                            error!(pipeline_id = %pipeline.id, error = %e, "Failed to clean up pipeline");
                            report.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to list completed pipelines");
                report.errors += 1;
            }
        }

        debug!(
            stepped = report.stepped,
            changed = report.changed,
            cleaned = report.cleaned,
            errors = report.errors,
            "Tick complete"
        );
        report
    }

    /// Tick on a fixed interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            retention = self.retention,
            "Starting reconciler"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
