//! Pipeline scheduling and reconciliation for fastci.

pub mod config;
pub mod dag;
pub mod job;
pub mod locks;
pub mod notify;
pub mod pipeline;
pub mod reconciler;
pub mod workspace;

pub use config::{SchedulerConfig, WorkspaceConfig};
pub use dag::{DagError, DependencyGraph};
pub use job::JobEngine;
pub use notify::BroadcastNotifier;
pub use pipeline::{PipelineEngine, PipelineView};
pub use reconciler::{Reconciler, TickReport};
