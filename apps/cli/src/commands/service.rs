//! `kiln service`: direct calls to the remote training service.

use crate::config::KilnConfig;
use anyhow::{bail, Context};
use colored::Colorize;
use kiln_bridge::{InferRequest, TrainingServiceClient};

fn client(config: &KilnConfig) -> anyhow::Result<TrainingServiceClient> {
    TrainingServiceClient::new(&config.base_url(), config.request_timeout()).context("creating service client")
}

pub async fn health(config: &KilnConfig) -> anyhow::Result<()> {
    let client = client(config)?;
    if client.health().await {
        println!("{} {} is healthy", "✓".green(), client.base_url());
        Ok(())
    } else {
        bail!("training service at {} is unreachable", client.base_url())
    }
}

pub async fn log(config: &KilnConfig) -> anyhow::Result<()> {
    let log = client(config)?.log().await.context("fetching service log")?;
    print!("{log}");
    if !log.ends_with('\n') {
        println!();
    }
    Ok(())
}

pub async fn infer(config: &KilnConfig, image: String, model: Option<String>, json: bool) -> anyhow::Result<()> {
    let response = client(config)?.infer(&InferRequest { image, model }).await.context("running inference")?;
    if let Some(err) = response.error.as_deref().filter(|e| !e.is_empty()) {
        bail!("inference failed: {err}");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{} {} ({:.3})", "Label:".bold(), response.best_label.green(), response.best_score);
    let mut scores: Vec<_> = response.all_scores.iter().collect();
    scores.sort_by(|a, b| b.1.total_cmp(a.1));
    for (label, score) in scores {
        println!("  {label:<16} {score:.3}");
    }
    Ok(())
}
