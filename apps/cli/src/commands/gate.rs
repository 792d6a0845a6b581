//! `kiln gate`: inspect or clear the process gate sentinel.

use crate::config::KilnConfig;
use colored::Colorize;
use kiln_orchestrator::{FileProcessGate, ProcessGate};

pub fn status(config: &KilnConfig) -> anyhow::Result<()> {
    let gate = FileProcessGate::new(config.gate_path());
    let state = if gate.is_running() { "Running".yellow() } else { "Idle".green() };
    println!("{} {}", "Gate:".bold(), state);
    println!("  File: {}", gate.path().display().to_string().dimmed());
    Ok(())
}

/// Clears a gate left behind by a job that did not shut down.
pub fn release(config: &KilnConfig) -> anyhow::Result<()> {
    let gate = FileProcessGate::new(config.gate_path());
    let was_running = gate.is_running();
    gate.set_running(false)?;
    if was_running {
        println!("{} Gate released", "✓".green());
    } else {
        println!("Gate was already idle");
    }
    Ok(())
}
