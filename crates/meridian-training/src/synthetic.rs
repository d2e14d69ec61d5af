//! Deterministic in-process engine and loader.
//!
//! `SyntheticEngine` stands in for an accelerator backend: it keeps a tiny
//! scalar "model" whose loss falls as updates are applied, with per-batch
//! noise derived from the seed and the batch's position in the corpus. Two
//! engines fed the same batches produce bit-identical losses, which makes it
//! suitable for driving the coordinator end to end.

use async_trait::async_trait;
use meridian_abstraction::{
    BatchLoader, DispatchPlan, EngineError, EvalOutcome, ExecutionEngine, LoaderError, MicroBatch, MicroBatchOutcome,
    ShardRef, StepContext, SyncPoint, UpdateOutcome,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Uniform in `[0, 1)`.
fn unit(x: u64) -> f64 {
    (splitmix64(x) >> 11) as f64 / (1u64 << 53) as f64
}

/// Exported engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticState {
    pub updates_applied: u64,
    pub parameter_norm: f64,
    pub warm_started: bool,
}

impl Default for SyntheticState {
    fn default() -> Self {
        Self { updates_applied: 0, parameter_norm: 1.0, warm_started: false }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: SyntheticState,
    pending_micro_batches: u64,
    pending_loss: f64,
    applied: Vec<StepContext>,
}

#[derive(Debug)]
pub struct SyntheticEngine {
    seed: u64,
    inner: Mutex<Inner>,
}

impl SyntheticEngine {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed, inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, EngineError> {
        self.inner.lock().map_err(|_| EngineError::Other("synthetic engine lock poisoned".to_string()))
    }

    fn loss(&self, state: &SyntheticState, reference: &ShardRef, salt: u64) -> f64 {
        let noise = unit(self.seed ^ salt ^ reference.epoch.rotate_left(32) ^ reference.first_sample);
        let progress = state.updates_applied as f64;
        1.5 + 8.0 / (1.0 + 0.05 * progress) + 0.25 * noise + 0.01 * state.parameter_norm
    }

    #[must_use]
    pub fn state(&self) -> SyntheticState {
        self.inner.lock().map(|i| i.state.clone()).unwrap_or_default()
    }

    /// Step contexts passed to `apply_update` by this process, in order.
    #[must_use]
    pub fn applied_updates(&self) -> Vec<StepContext> {
        self.inner.lock().map(|i| i.applied.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn pending_micro_batches(&self) -> u64 {
        self.inner.lock().map(|i| i.pending_micro_batches).unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionEngine for SyntheticEngine {
    fn id(&self) -> &str {
        "synthetic"
    }

    async fn load_warm_start(&self, snapshot: &Path) -> Result<(), EngineError> {
        let bytes = tokio::fs::read(snapshot)
            .await
            .map_err(|e| EngineError::Snapshot(format!("{}: {e}", snapshot.display())))?;
        let mut inner = self.lock()?;
        inner.state.parameter_norm = 1.0 + (bytes.len() % 1000) as f64 / 1000.0;
        inner.state.warm_started = true;
        debug!(bytes = bytes.len(), "Synthetic engine warm started");
        Ok(())
    }

    async fn forward_backward(
        &self,
        batch: &MicroBatch,
        plan: &DispatchPlan,
        step: &StepContext,
    ) -> Result<MicroBatchOutcome, EngineError> {
        if batch.context_length != step.context_length {
            return Err(EngineError::Execution(format!(
                "batch packed to {} tokens, step expects {}",
                batch.context_length, step.context_length
            )));
        }
        let covered = (plan.per_replica_batch * plan.dp_devices) as u64;
        if covered != batch.reference.samples() {
            return Err(EngineError::Execution(format!(
                "dispatch plan covers {covered} samples, batch holds {}",
                batch.reference.samples()
            )));
        }

        let mut inner = self.lock()?;
        let loss = self.loss(&inner.state, &batch.reference, 0);
        inner.pending_micro_batches += 1;
        inner.pending_loss += loss;
        Ok(MicroBatchOutcome { loss })
    }

    async fn apply_update(&self, step: &StepContext) -> Result<UpdateOutcome, EngineError> {
        let mut inner = self.lock()?;
        let consumed = std::mem::take(&mut inner.pending_micro_batches);
        let window_loss = std::mem::take(&mut inner.pending_loss);
        if consumed > 0 {
            let mean = window_loss / consumed as f64;
            let norm = inner.state.parameter_norm;
            inner.state.parameter_norm = norm * step.weight_decay.mul_add(-step.learning_rate, 1.0)
                + step.learning_rate * mean;
            inner.state.updates_applied += 1;
            inner.applied.push(step.clone());
        }
        Ok(UpdateOutcome { consumed_micro_batches: consumed })
    }

    async fn accumulated_micro_batches(&self) -> Result<u64, EngineError> {
        Ok(self.lock()?.pending_micro_batches)
    }

    async fn discard_accumulated(&self) -> Result<u64, EngineError> {
        let mut inner = self.lock()?;
        inner.pending_loss = 0.0;
        Ok(std::mem::take(&mut inner.pending_micro_batches))
    }

    async fn evaluate(&self, batch: &MicroBatch, _plan: &DispatchPlan) -> Result<EvalOutcome, EngineError> {
        let inner = self.lock()?;
        Ok(EvalOutcome { loss: self.loss(&inner.state, &batch.reference, 0xE7A1) })
    }

    async fn synchronize(&self, point: &SyncPoint) -> Result<SyncPoint, EngineError> {
        let inner = self.lock()?;
        if inner.state.updates_applied != point.global_step {
            return Err(EngineError::StateMismatch(format!(
                "engine applied {} updates, coordinator is at step {}",
                inner.state.updates_applied, point.global_step
            )));
        }
        Ok(point.clone())
    }

    async fn export_state(&self) -> Result<Vec<u8>, EngineError> {
        let inner = self.lock()?;
        if inner.pending_micro_batches > 0 {
            return Err(EngineError::StateCodec(format!(
                "cannot export with {} accumulated micro-batches",
                inner.pending_micro_batches
            )));
        }
        serde_json::to_vec(&inner.state).map_err(|e| EngineError::StateCodec(e.to_string()))
    }

    async fn import_state(&self, state: &[u8]) -> Result<(), EngineError> {
        let restored: SyntheticState =
            serde_json::from_slice(state).map_err(|e| EngineError::StateCodec(e.to_string()))?;
        let mut inner = self.lock()?;
        inner.state = restored;
        inner.pending_micro_batches = 0;
        inner.pending_loss = 0.0;
        Ok(())
    }
}

/// Loader that leaves reading to the engine, or fills deterministic tokens.
#[derive(Debug, Clone, Default)]
pub struct SyntheticLoader {
    seed: u64,
    vocab_size: Option<u32>,
}

impl SyntheticLoader {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed, vocab_size: None }
    }

    /// Materialize `samples × context_length` token ids below `vocab_size`.
    #[must_use]
    pub fn with_vocab(mut self, vocab_size: u32) -> Self {
        self.vocab_size = Some(vocab_size.max(1));
        self
    }
}

#[async_trait]
impl BatchLoader for SyntheticLoader {
    async fn load(&self, reference: &ShardRef, context_length: usize) -> Result<MicroBatch, LoaderError> {
        let tokens = match self.vocab_size {
            None => Vec::new(),
            Some(vocab) => {
                let count = reference.samples() * context_length as u64;
                let base = self.seed ^ reference.epoch.rotate_left(32) ^ reference.first_sample;
                (0..count).map(|i| (splitmix64(base.wrapping_add(i)) % u64::from(vocab)) as u32).collect()
            }
        };
        Ok(MicroBatch { reference: reference.clone(), context_length, tokens })
    }
}
