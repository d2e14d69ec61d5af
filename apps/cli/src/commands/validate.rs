//! Manifest validation command.
//!
//! Loads a manifest, checks every invariant (schedule, mesh, accumulation,
//! cadence, shard capacity) and reports the derived run shape.

use anyhow::Context;
use colored::Colorize;
use meridian_training::{MeshPartitioner, ScheduleEngine, ShardIndex, TrainCursor};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct RunShape {
    manifest: String,
    fingerprint: String,
    train_shards: usize,
    train_capacity: u64,
    validation_shards: usize,
    batches_per_epoch: u64,
    effective_batch_size: u64,
    per_replica_batch: usize,
    world_size: usize,
    total_steps: u64,
    tokens_at_completion: u64,
    warnings: Vec<String>,
}

/// Execute the validate command.
///
/// Invalid manifests propagate as errors so the process exits non-zero.
pub fn execute(path: &Path, json: bool) -> anyhow::Result<()> {
    let (config, warnings) = super::load_manifest(path)?;
    let t = &config.training;

    let train = ShardIndex::resolve_train(&config.data).context("Failed to resolve training shards")?;
    let train_shards = train.len();
    let train_capacity = train.total_samples();
    let cursor = TrainCursor::new(train, t.batch_size, config.data.train_samples, t.max_epochs)?;
    let validation_shards = ShardIndex::resolve_validation(&config.data)
        .context("Failed to resolve validation shards")?
        .map_or(0, |i| i.len());

    let mesh = MeshPartitioner::from_config(&config.device)?;
    let shard = mesh.partition(t.batch_size)?;
    let schedule = ScheduleEngine::from_config(&config)?;

    let shape = RunShape {
        manifest: path.display().to_string(),
        fingerprint: config.fingerprint()?,
        train_shards,
        train_capacity,
        validation_shards,
        batches_per_epoch: cursor.batches_per_epoch(),
        effective_batch_size: t.batch_size as u64 * t.gradient_accumulation_steps,
        per_replica_batch: shard.per_replica_batch,
        world_size: mesh.world_size(),
        total_steps: schedule.total_steps(),
        tokens_at_completion: schedule.tokens_seen(schedule.total_steps()),
        warnings: warnings.iter().map(ToString::to_string).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&shape)?);
        return Ok(());
    }

    println!("{}", "meridian validate".bold().cyan());
    println!();
    println!("  Manifest:          {}", shape.manifest);
    println!("  Fingerprint:       {}", shape.fingerprint[..16.min(shape.fingerprint.len())].dimmed());
    println!("  Train shards:      {} ({} samples)", shape.train_shards, shape.train_capacity);
    println!("  Validation shards: {}", shape.validation_shards);
    println!("  Batches per epoch: {}", shape.batches_per_epoch);
    println!("  Effective batch:   {}", shape.effective_batch_size);
    println!("  Mesh:              {} devices, {} samples per replica", shape.world_size, shape.per_replica_batch);
    println!("  Total steps:       {}", shape.total_steps);
    println!("  Tokens (B):        {:.3}", shape.tokens_at_completion as f64 / 1e9);
    println!();

    if shape.warnings.is_empty() {
        println!("  {}", "✓ Manifest is valid".green());
    } else {
        for warning in &shape.warnings {
            println!("  {} {}", "!".yellow().bold(), warning.yellow());
        }
        println!();
        println!("  {}", format!("✓ Manifest is valid with {} warning(s)", shape.warnings.len()).green());
    }
    println!();
    Ok(())
}
