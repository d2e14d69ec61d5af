//! Meridian CLI - drive and inspect pretraining runs
//!
//! Provides the `meridian` command: run the coordinator against a manifest,
//! validate manifests, preview the step schedule and inspect checkpoints.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use meridian_training::TrainingError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::{checkpoints, schedule, train, validate};

/// Meridian - step scheduling and run coordination for pretraining
#[derive(Parser, Debug)]
#[command(
    name = "meridian",
    author,
    version,
    about = "Meridian - pretraining run coordinator",
    long_about = "Meridian drives a pretraining run from a manifest: learning-rate and context schedules,\n\
                  gradient accumulation, device-mesh sharding, evaluation cadence and resumable checkpoints."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit log lines as JSON objects
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run training from a manifest
    ///
    /// Uses the built-in synthetic engine and loader. Checkpoints land in the
    /// manifest's data.checkpoint_directory.
    Train {
        /// Path to the training manifest (YAML, TOML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Continue from the newest valid checkpoint instead of starting over
        #[arg(long)]
        resume: bool,

        /// Stop after this many optimizer updates in this invocation
        #[arg(long)]
        max_updates: Option<u64>,

        /// This worker's rank for the validation partition
        #[arg(long, default_value_t = 0)]
        worker_rank: usize,

        /// Number of workers sharing the validation shards
        #[arg(long, default_value_t = 1)]
        worker_count: usize,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a manifest against every run invariant
    Validate {
        /// Path to the training manifest
        #[arg(short, long)]
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Preview the learning-rate and context-length schedule
    Schedule {
        /// Path to the training manifest
        #[arg(short, long)]
        config: PathBuf,

        /// First step to show
        #[arg(long, default_value_t = 0)]
        from: u64,

        /// Last step to show (defaults to total_steps)
        #[arg(long)]
        to: Option<u64>,

        /// Show every Nth step
        #[arg(long)]
        every: Option<u64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List published checkpoints and verify their artifacts
    Checkpoints {
        /// Path to the training manifest
        #[arg(short, long)]
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(log_level: Option<&str>, json: bool) -> anyhow::Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(format!("meridian_training={level},meridian_cli={level}"))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("meridian_training=info,meridian_cli=info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().try_init().map_err(|e| anyhow::anyhow!(e))?;
    } else {
        builder.without_time().try_init().map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

async fn dispatch(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Train { config, resume, max_updates, worker_rank, worker_count, json } => {
            train::execute(train::TrainArgs { config, resume, max_updates, worker_rank, worker_count, json })
                .await
        }
        Command::Validate { config, json } => validate::execute(&config, json),
        Command::Schedule { config, from, to, every, json } => {
            schedule::execute(&config, schedule::ScheduleWindow { from, to, every }, json)
        }
        Command::Checkpoints { config, json } => checkpoints::execute(&config, json),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(args.log_level.as_deref(), args.log_json) {
        eprintln!("{} failed to initialize logging: {}", "error:".red().bold(), e);
        std::process::exit(2);
    }

    if let Err(err) = dispatch(args.command).await {
        let invariant = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<TrainingError>())
            .map_or("Error", TrainingError::invariant);
        eprintln!("{} [{}] {:#}", "error:".red().bold(), invariant.yellow(), err);
        std::process::exit(1);
    }
}
