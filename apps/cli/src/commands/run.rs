//! `kiln run`: admit one job and drive it through the remote training service.

use crate::config::{load_job, KilnConfig};
use anyhow::Context;
use colored::Colorize;
use kiln_bridge::{HttpBridgeFactory, HttpModelUploader};
use kiln_orchestrator::{FileProcessGate, JobOutcome, ResourceClassRegistry, TrainingOrchestrator};
use kiln_training::{JsonlProgressSink, ResourceClass, TrainingLayout, UploadOutcome};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

fn orchestrator(config: &KilnConfig) -> anyhow::Result<TrainingOrchestrator> {
    let bridge = config.bridge_config()?;
    let layout = TrainingLayout::new(config.artifacts_root());
    let registry = ResourceClassRegistry::new(config.lanes()?, Arc::new(HttpBridgeFactory::new(bridge)));

    Ok(TrainingOrchestrator::new(
        Arc::new(FileProcessGate::new(config.gate_path())),
        Arc::new(registry),
        Arc::new(JsonlProgressSink::new(layout.clone())),
        Arc::new(HttpModelUploader::new(config.upload_timeout())),
        layout,
    ))
}

pub async fn execute(config: &KilnConfig, job: &Path, class: &str, json_output: bool) -> anyhow::Result<()> {
    let class: ResourceClass = class.parse()?;
    let params = load_job(job)?;
    let orchestrator = orchestrator(config)?;

    let handle = orchestrator.start(class, params).context("job was not admitted")?;
    if !json_output {
        println!("{} job {} on {}", "Started".bold().cyan(), handle.job_id().to_string().bold(), class);
    }

    let cancel = handle.cancellation_token();
    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        result = &mut wait => result,
        () = interrupted(tokio::signal::ctrl_c()) => {
            warn!("Interrupted, cancelling training job");
            cancel.cancel();
            wait.await
        }
    }?;

    if json_output {
        print_json(&outcome)?;
    } else {
        print_human(&outcome, orchestrator.layout());
    }
    Ok(())
}

/// Resolves when `signal` fires. If the handler cannot be installed it never
/// resolves.
async fn interrupted(signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = signal.await {
        warn!(error = %e, "Cannot listen for Ctrl-C, the job runs until it finishes");
        std::future::pending::<()>().await;
    }
}

fn print_json(outcome: &JobOutcome) -> anyhow::Result<()> {
    let value = json!({
        "job": outcome.job,
        "models": outcome.models,
        "confusion": outcome.confusion,
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_human(outcome: &JobOutcome, layout: &TrainingLayout) {
    let job = &outcome.job;
    println!("{} job {}", "Completed".bold().green(), job.job_id);
    println!("  Best iteration: {}", job.best_iteration);
    println!("  Accuracy:       {:.3}", job.accuracy);
    if let Some(duration) = job.duration_secs() {
        println!("  Duration:       {duration:.1}s");
    }
    for label in &job.label_accuracies {
        println!("    {:<16} {:.3}", label.label, label.accuracy);
    }

    if !outcome.models.is_empty() {
        println!();
        println!("{}", "Models:".bold());
        for model in &outcome.models {
            let state = match model.outcome {
                UploadOutcome::Saved => "saved".green(),
                UploadOutcome::Pending => "pending".yellow(),
                UploadOutcome::Error => "error".red(),
            };
            println!("  {} / {} → {} [{}]", model.device, model.process_name, model.remote_path, state);
        }
    }

    println!();
    println!("  Records: {}", layout.job_dir(&job.job_id).display().to_string().dimmed());
}
