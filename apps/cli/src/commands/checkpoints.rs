//! Checkpoint listing command.
//!
//! Lists every published step directory and re-verifies its artifact hashes,
//! marking the checkpoint a resume would pick.

use anyhow::Context;
use colored::Colorize;
use comfy_table::{Cell, Color as ComfyColor, Table};
use meridian_training::{CheckpointReason, CheckpointStore, ManifestConfig};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct CheckpointRow {
    step: u64,
    path: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    epoch: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<CheckpointReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    samples_consumed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint_matches: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Listing {
    directory: String,
    keep: usize,
    resume_step: Option<u64>,
    checkpoints: Vec<CheckpointRow>,
}

pub fn execute(path: &Path, json: bool) -> anyhow::Result<()> {
    let config =
        ManifestConfig::load(path).with_context(|| format!("Failed to load manifest {}", path.display()))?;
    let fingerprint = config.fingerprint()?;
    let store = CheckpointStore::new(config.data.checkpoint_directory.clone(), config.training.keep_checkpoints);

    let entries = store.list().context("Failed to list checkpoints")?;
    let checkpoints: Vec<CheckpointRow> = entries
        .iter()
        .map(|entry| match store.load(entry.step) {
            Ok(loaded) => CheckpointRow {
                step: entry.step,
                path: entry.path.display().to_string(),
                valid: true,
                epoch: Some(loaded.manifest.epoch),
                reason: Some(loaded.manifest.reason),
                created_at: Some(loaded.manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
                samples_consumed: Some(loaded.state.train_cursor.samples_consumed),
                fingerprint_matches: Some(loaded.manifest.config_fingerprint == fingerprint),
                error: None,
            },
            Err(e) => CheckpointRow {
                step: entry.step,
                path: entry.path.display().to_string(),
                valid: false,
                epoch: None,
                reason: None,
                created_at: None,
                samples_consumed: None,
                fingerprint_matches: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    let listing = Listing {
        directory: store.root().display().to_string(),
        keep: store.keep(),
        resume_step: checkpoints.iter().rev().find(|c| c.valid).map(|c| c.step),
        checkpoints,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!("{}", format!("Checkpoints ({})", listing.checkpoints.len()).bold().cyan());
    println!("  {}", listing.directory.dimmed());
    println!();

    if listing.checkpoints.is_empty() {
        println!("  {}", "No checkpoints published yet.".dimmed());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Step", "Epoch", "Reason", "Created", "Samples", "Status"]);
    for row in &listing.checkpoints {
        let status = if !row.valid {
            Cell::new(row.error.as_deref().unwrap_or("invalid")).fg(ComfyColor::Red)
        } else if row.fingerprint_matches == Some(false) {
            Cell::new("ok (manifest changed)").fg(ComfyColor::Yellow)
        } else {
            Cell::new("ok").fg(ComfyColor::Green)
        };
        table.add_row(vec![
            Cell::new(row.step),
            Cell::new(row.epoch.map_or_else(|| "-".to_string(), |e| e.to_string())),
            Cell::new(row.reason.map_or_else(|| "-".to_string(), |r| r.to_string())),
            Cell::new(row.created_at.as_deref().unwrap_or("-")),
            Cell::new(row.samples_consumed.map_or_else(|| "-".to_string(), |s| s.to_string())),
            status,
        ]);
    }
    println!("{table}");
    println!();

    match listing.resume_step {
        Some(step) => println!("  Resume would continue from step {}", step.to_string().cyan()),
        None => println!("  {}", "No valid checkpoint; a resume would start fresh.".yellow()),
    }
    println!();
    Ok(())
}
