//! Training command implementation.
//!
//! Drives a `RunCoordinator` over the synthetic engine and loader. Ctrl-C
//! requests a cooperative shutdown: the partial accumulation window is
//! forfeited and a final checkpoint is written.

use anyhow::{Context, Result};
use colored::Colorize;
use meridian_abstraction::MetricsSink;
use meridian_training::{
    FanoutSink, JsonlMetricsSink, ManifestConfig, RunCoordinator, RunOptions, RunSummary, ShutdownSignal, StartMode,
    StartOutcome, SyntheticEngine, SyntheticLoader, Termination, TracingMetricsSink,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct TrainArgs {
    pub config: PathBuf,
    pub resume: bool,
    pub max_updates: Option<u64>,
    pub worker_rank: usize,
    pub worker_count: usize,
    pub json: bool,
}

#[derive(Serialize)]
struct TrainReport<'a> {
    manifest: String,
    checkpoint_directory: String,
    start: StartOutcome,
    summary: &'a RunSummary,
}

pub async fn execute(args: TrainArgs) -> Result<()> {
    let config = ManifestConfig::load(&args.config)
        .with_context(|| format!("Failed to load manifest {}", args.config.display()))?;
    let checkpoint_directory = config.data.checkpoint_directory.clone();
    let seed = config.training.seed;
    let sink = build_sink(&config)?;

    let options =
        RunOptions { max_updates: args.max_updates, worker_rank: args.worker_rank, worker_count: args.worker_count };
    let mut coordinator = RunCoordinator::new(
        config,
        Arc::new(SyntheticEngine::new(seed)),
        Arc::new(SyntheticLoader::new(seed)),
        sink,
        options,
    )
    .context("Failed to prepare training run")?;

    let shutdown = ShutdownSignal::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing at the next micro-batch boundary");
            on_interrupt.trigger();
        }
    });

    let mode = if args.resume { StartMode::Resume } else { StartMode::Fresh };
    let start = coordinator.start(mode).await.context("Failed to start training run")?;
    info!(?start, "Run started");

    let summary = coordinator.run(&shutdown).await.context("Training run failed")?;

    if args.json {
        let report = TrainReport {
            manifest: args.config.display().to_string(),
            checkpoint_directory: checkpoint_directory.display().to_string(),
            start,
            summary: &summary,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    let headline = match summary.termination {
        Termination::Completed => "Training complete".bold().green(),
        Termination::EpochsExhausted => "Training stopped: epochs exhausted".bold().yellow(),
        Termination::Shutdown => "Training interrupted".bold().yellow(),
        Termination::UpdateLimit => "Training paused at update limit".bold().cyan(),
    };
    println!("{}", headline);
    println!("  Start:       {}", describe_start(start));
    println!("  Final step:  {}", summary.final_step.to_string().cyan());
    println!("  Epochs:      {}", summary.epochs_completed);
    match summary.last_checkpoint {
        Some(step) => {
            println!("  Checkpoint:  step {} in {}", step, checkpoint_directory.display().to_string().dimmed());
        }
        None => println!("  Checkpoint:  {}", "none".dimmed()),
    }
    if let Some(eval) = &summary.last_evaluation {
        println!("  Last eval:   step {} loss {:.4} over {} batch(es)", eval.step, eval.mean_loss, eval.batches);
    }
    if summary.termination != Termination::Completed {
        println!();
        println!("  {}", format!("Continue with: meridian train --config {} --resume", args.config.display()).dimmed());
    }
    println!();
    Ok(())
}

/// Tracing output always, plus a JSONL file when `metrics.log_path` is set.
fn build_sink(config: &ManifestConfig) -> Result<Arc<dyn MetricsSink>> {
    let mut fanout = FanoutSink::new().with(Arc::new(TracingMetricsSink));
    if let Some(path) = &config.metrics.log_path {
        let file = JsonlMetricsSink::open(path)
            .with_context(|| format!("Failed to open metrics log {}", path.display()))?;
        fanout = fanout.with(Arc::new(file));
    }
    if let Some(project) = config.tracking_project() {
        info!(project = %project, "Remote tracking is not built in; metrics stay local");
    }
    Ok(Arc::new(fanout))
}

fn describe_start(start: StartOutcome) -> String {
    match start {
        StartOutcome::Fresh { cleared_checkpoints: 0 } => "fresh".to_string(),
        StartOutcome::Fresh { cleared_checkpoints } => {
            format!("fresh (cleared {} checkpoint(s))", cleared_checkpoints)
        }
        StartOutcome::WarmStarted { cleared_checkpoints } => {
            format!("warm start (cleared {} checkpoint(s))", cleared_checkpoints)
        }
        StartOutcome::Resumed { step } => format!("resumed from step {}", step),
    }
}
