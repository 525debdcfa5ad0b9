//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reconciler until interrupted
    Run {
        /// Pipeline documents to submit at startup
        #[arg(short, long = "pipeline")]
        pipelines: Vec<PathBuf>,
    },

    /// Create a pipeline from a document in the daemon's database
    Create {
        /// Path to the pipeline document (JSON or YAML)
        path: PathBuf,
    },

    /// Cancel a pipeline and all of its jobs
    Cancel {
        /// Pipeline ID
        pipeline_id: String,
    },

    /// Cancel a single job
    CancelJob {
        /// Job ID
        job_id: String,
    },

    /// Refresh a single job from its container
    PollJob {
        /// Job ID
        job_id: String,
    },

    /// Show a pipeline and its jobs
    Status {
        /// Pipeline ID
        pipeline_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a pipeline document and print its layers
    Validate {
        /// Path to the pipeline document
        #[arg(default_value = "pipeline.json")]
        path: PathBuf,
    },

    /// Print the JSON Schema of pipeline documents
    Schema,
}
