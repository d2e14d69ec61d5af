//! Shared helpers for the coordinator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use meridian_abstraction::{BatchLoader, LoaderError, MetricsSink, MicroBatch, ShardRef};
use meridian_training::{
    ManifestConfig, RecordingMetricsSink, RunCoordinator, RunOptions, ShutdownSignal, SyntheticEngine, SyntheticLoader,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

/// 2 train shards × 40 samples, batch 4 over 2 replicas, accumulation 2:
/// 20 micro-batches and 10 updates per epoch. 24 total steps, evaluation
/// every 5.
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
io:
  max_attempts: 3
  initial_backoff_ms: 1
  max_backoff_ms: 2
";

pub fn manifest(temp: &TempDir) -> ManifestConfig {
    let mut config = ManifestConfig::from_yaml_str(MANIFEST).unwrap();
    config.resolve_paths(temp.path());
    config
}

pub struct Harness {
    pub coordinator: RunCoordinator,
    pub engine: Arc<SyntheticEngine>,
    pub sink: Arc<RecordingMetricsSink>,
}

pub fn harness(config: ManifestConfig, options: RunOptions) -> Harness {
    harness_with_loader(config, options, Arc::new(SyntheticLoader::new(3)))
}

pub fn harness_with_loader(config: ManifestConfig, options: RunOptions, loader: Arc<dyn BatchLoader>) -> Harness {
    let engine = Arc::new(SyntheticEngine::new(config.training.seed));
    let sink = Arc::new(RecordingMetricsSink::new());
    let sink_dyn: Arc<dyn MetricsSink> = sink.clone();
    let coordinator = RunCoordinator::new(config, engine.clone(), loader, sink_dyn, options).unwrap();
    Harness { coordinator, engine, sink }
}

/// Requests shutdown once `after` batches have been loaded.
pub struct TriggeringLoader {
    inner: SyntheticLoader,
    shutdown: ShutdownSignal,
    after: u64,
    loads: AtomicU64,
}

impl TriggeringLoader {
    pub fn new(shutdown: ShutdownSignal, after: u64) -> Self {
        Self { inner: SyntheticLoader::new(3), shutdown, after, loads: AtomicU64::new(0) }
    }
}

#[async_trait]
impl BatchLoader for TriggeringLoader {
    async fn load(&self, reference: &ShardRef, context_length: usize) -> Result<MicroBatch, LoaderError> {
        let batch = self.inner.load(reference, context_length).await?;
        if self.loads.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.shutdown.trigger();
        }
        Ok(batch)
    }
}

/// Fails the first `failures` calls with `error`, then behaves.
pub struct FlakyLoader {
    inner: SyntheticLoader,
    failures: u64,
    error: LoaderError,
    calls: AtomicU64,
}

impl FlakyLoader {
    pub fn new(failures: u64, error: LoaderError) -> Self {
        Self { inner: SyntheticLoader::new(3), failures, error, calls: AtomicU64::new(0) }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchLoader for FlakyLoader {
    async fn load(&self, reference: &ShardRef, context_length: usize) -> Result<MicroBatch, LoaderError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(self.error.clone());
        }
        self.inner.load(reference, context_length).await
    }
}
