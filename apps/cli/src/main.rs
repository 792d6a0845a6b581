//! Kiln CLI - admission and lifecycle control for model-training jobs
//!
//! This CLI provides a `kiln` command that runs training jobs against the
//! remote training service and inspects the process gate.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::KilnConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Kiln - training-job orchestrator
#[derive(Parser, Debug)]
#[command(name = "kiln", author, version, about = "Kiln - training-job orchestrator")]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file (skips discovery of ./kiln.toml and ~/.kiln/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one training job to completion
    ///
    /// Admits the job on the given resource class, drives it through the
    /// remote training service and uploads the resulting models. Ctrl-C
    /// cancels the job.
    Run {
        /// Job description (TOML)
        #[arg(long)]
        job: PathBuf,

        /// Resource class (Small, Medium, Large)
        #[arg(long)]
        class: String,

        /// Output the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or clear the process gate
    #[command(subcommand)]
    Gate(GateCommand),

    /// Talk to the remote training service
    #[command(subcommand)]
    Service(ServiceCommand),
}

#[derive(Subcommand, Debug)]
enum GateCommand {
    /// Show whether a job holds the gate
    Status,
    /// Force the gate back to idle
    Release,
}

#[derive(Subcommand, Debug)]
enum ServiceCommand {
    /// Check that the service responds
    Health,
    /// Print the service's training log
    Log,
    /// Classify a single image
    Infer {
        /// Image path as seen by the service
        image: String,

        /// Model to use instead of the service default
        #[arg(long)]
        model: Option<String>,

        /// Output the response as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr);
    if json {
        builder.json().try_init().map_err(|e| anyhow::anyhow!("{e}"))?;
    } else {
        builder.without_time().try_init().map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = KilnConfig::load(args.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());

    let level = args.log_level.clone().or_else(|| config.log_level.clone()).unwrap_or_else(|| "info".to_string());
    init_logging(&level, args.log_json)?;

    match args.command {
        Command::Run { job, class, json } => commands::run::execute(&config, &job, &class, json).await,
        Command::Gate(GateCommand::Status) => commands::gate::status(&config),
        Command::Gate(GateCommand::Release) => commands::gate::release(&config),
        Command::Service(ServiceCommand::Health) => commands::service::health(&config).await,
        Command::Service(ServiceCommand::Log) => commands::service::log(&config).await,
        Command::Service(ServiceCommand::Infer { image, model, json }) => {
            commands::service::infer(&config, image, model, json).await
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
