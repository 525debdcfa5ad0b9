//! fastci CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;

mod commands;
mod config;
mod handlers;
mod telemetry;

use commands::Commands;
use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "fastci")]
#[command(author, version, about = "Container-backed CI pipelines", long_about = None)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true, default_value = "fastci.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = DaemonConfig::load(Some(&cli.config))?;
    telemetry::init(&config.log);

    match cli.command {
        Commands::Run { pipelines } => handlers::run(&config, &pipelines).await?,
        Commands::Create { path } => handlers::create(&config, &path).await?,
        Commands::Cancel { pipeline_id } => handlers::cancel(&config, &pipeline_id).await?,
        Commands::CancelJob { job_id } => handlers::cancel_job(&config, &job_id).await?,
        Commands::PollJob { job_id } => handlers::poll_job(&config, &job_id).await?,
        Commands::Status { pipeline_id, json } => {
            handlers::status(&config, &pipeline_id, json).await?
        }
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Schema => handlers::schema()?,
    }

    Ok(())
}
