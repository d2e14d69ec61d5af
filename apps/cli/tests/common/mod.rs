//! Shared fixtures for the CLI integration tests.

#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// 24 optimizer steps over 2 shards of 40 samples, evaluation every 5.
pub const MANIFEST: &str = r"
training:
  max_epochs: 3
  batch_size: 4
  peak_learning_rate: 0.0006
  warmup_steps: 4
  decay_steps: 20
  total_steps: 24
  end_learning_rate: 0.00006
  weight_decay: 0.1
  gradient_accumulation_steps: 2
  evaluation_frequency: 5
  maximum_evaluation_steps: 3
  precision: bf16
  staged_warmup_steps: 6
  warmup_train_context: 64
  seed: 17
model:
  size: tiny
  warm_start: false
data:
  corpus: synthetic
  train_shard_urls: ['train-0.tar', 'train-1.tar']
  validation_shard_urls: ['val-0.tar', 'val-1.tar']
  max_context: 128
  train_samples: 80
  checkpoint_directory: checkpoints
  samples_per_shard: 40
device:
  dp_devices: 2
  mp_devices: 1
metrics:
  log_path: metrics.jsonl
io:
  max_attempts: 3
  initial_backoff_ms: 1
  max_backoff_ms: 2
";

/// Write `MANIFEST`, with `replace` substitutions applied, into `temp`.
pub fn write_manifest(temp: &TempDir, replace: &[(&str, &str)]) -> PathBuf {
    let mut contents = MANIFEST.to_string();
    for (from, to) in replace {
        assert!(contents.contains(from), "fixture has no {from:?}");
        contents = contents.replace(from, to);
    }
    let path = temp.path().join("manifest.yaml");
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn meridian() -> Command {
    let mut cmd = Command::cargo_bin("meridian-cli").unwrap();
    cmd.env_remove("RUST_LOG").env("NO_COLOR", "1");
    cmd
}

/// Run a subcommand with `--json` and parse its stdout.
pub fn run_json(args: &[&str], manifest: &Path) -> serde_json::Value {
    let output = meridian().args(args).arg("--config").arg(manifest).arg("--json").output().unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}
