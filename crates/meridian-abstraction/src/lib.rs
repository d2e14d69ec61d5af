//! Collaborator abstraction layer for Meridian.
//!
//! This module defines the traits the run coordinator drives and the value
//! types that cross them. The coordinator never inspects tensors, token
//! payloads, or parameter bytes; everything numeric happens behind
//! [`ExecutionEngine`], everything beneath a shard reference happens behind
//! [`BatchLoader`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Represents an error reported by the model-execution engine.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    /// The forward/backward pass, update, or evaluation failed.
    #[error("Execution Error: {0}")]
    Execution(String),

    /// The warm-start snapshot could not be read or was rejected.
    #[error("Snapshot Error: {0}")]
    Snapshot(String),

    /// Workers disagreed on the run state at a synchronization point.
    #[error("State Mismatch: {0}")]
    StateMismatch(String),

    /// Persisted engine state could not be exported or imported.
    #[error("State Codec Error: {0}")]
    StateCodec(String),

    /// Other unexpected errors.
    #[error("Other Engine Error: {0}")]
    Other(String),
}

/// Represents an error reported by the data-loading subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoaderError {
    /// A retryable failure (network blip, throttled object store, ...).
    #[error("Transient Load Error: {0}")]
    Transient(String),

    /// A failure that will not go away on retry.
    #[error("Fatal Load Error: {0}")]
    Fatal(String),
}

impl LoaderError {
    /// Whether the loader suggests retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Represents an error reported by a metrics sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Metrics Sink Error: {0}")]
pub struct SinkError(pub String);

/// Numeric precision the engine should run the model in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        };
        f.write_str(name)
    }
}

/// A contiguous run of samples inside one physical shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpan {
    /// Ordinal of the shard in its index.
    pub shard: usize,
    /// Physical location of the shard (URL or path).
    pub location: String,
    /// First sample inside the shard.
    pub offset: u64,
    /// Number of samples taken from the shard.
    pub len: u64,
}

/// Reference to the samples that make up one micro-batch.
///
/// A reference may straddle a shard boundary, in which case it carries one
/// span per shard touched, in read order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    /// Epoch the samples belong to.
    pub epoch: u64,
    /// Logical index of the first sample within the epoch.
    pub first_sample: u64,
    /// Physical spans, in read order.
    pub spans: Vec<ShardSpan>,
}

impl ShardRef {
    /// Total number of samples referenced.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.spans.iter().map(|s| s.len).sum()
    }
}

/// Logical position of a device in the data-parallel × model-parallel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshCoord {
    pub dp_rank: usize,
    pub mp_rank: usize,
}

/// The slice of a micro-batch a single device is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub coord: MeshCoord,
    /// Row-major ordinal: `dp_rank * mp_devices + mp_rank`.
    pub device_ordinal: usize,
    /// Offset of the first sample of this replica within the micro-batch.
    pub sample_offset: usize,
    /// Number of samples this replica processes.
    pub sample_count: usize,
}

/// How one micro-batch is spread over the device mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPlan {
    pub dp_devices: usize,
    pub mp_devices: usize,
    pub per_replica_batch: usize,
    pub assignments: Vec<DeviceAssignment>,
}

impl DispatchPlan {
    /// Looks up the assignment for a mesh coordinate.
    #[must_use]
    pub fn assignment(&self, coord: MeshCoord) -> Option<&DeviceAssignment> {
        self.assignments.iter().find(|a| a.coord == coord)
    }
}

/// A micro-batch materialized by the data-loading subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroBatch {
    /// The samples this batch was read from.
    pub reference: ShardRef,
    /// Sequence length every sample is truncated/packed to.
    pub context_length: usize,
    /// Flattened token ids, `samples × context_length` when materialized.
    /// Loaders that leave reading to the engine may return an empty vector.
    #[serde(default)]
    pub tokens: Vec<u32>,
}

/// Schedule values the engine needs for the current micro-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    /// Optimizer step the micro-batch contributes to.
    pub global_step: u64,
    /// Position of the micro-batch inside its accumulation window.
    pub micro_step: u64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub context_length: usize,
    pub precision: Precision,
}

/// Result of one forward/backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MicroBatchOutcome {
    pub loss: f64,
}

/// Result of an optimizer update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    /// Micro-batches whose gradients went into the update.
    pub consumed_micro_batches: u64,
}

/// Result of one evaluation batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub loss: f64,
}

/// The value every worker must agree on at an update boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub global_step: u64,
    pub epoch: u64,
    /// Logical sample index of the committed training cursor.
    pub samples_consumed: u64,
}

/// Which phase a metrics record comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsKind {
    Train,
    Evaluation,
}

/// A batch of named scalar metrics for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// Experiment-tracking project the record belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub step: u64,
    pub kind: MetricsKind,
    pub values: BTreeMap<String, f64>,
}

impl MetricsRecord {
    #[must_use]
    pub fn new(project: Option<String>, step: u64, kind: MetricsKind) -> Self {
        Self { project, step, kind, values: BTreeMap::new() }
    }

    /// Adds a named value, builder style.
    #[must_use]
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// The external model-execution engine.
///
/// Implementations own the parameters, gradients and optimizer state. The
/// coordinator guarantees that `apply_update` is only called once
/// `accumulated_micro_batches` reports a full window and that `discard_accumulated` is called for every
/// window it abandons.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Returns the engine identifier.
    fn id(&self) -> &str;

    /// Loads initial parameters from a warm-start snapshot.
    ///
    /// # Errors
    /// Returns an `EngineError` if the snapshot cannot be read.
    async fn load_warm_start(&self, snapshot: &Path) -> Result<(), EngineError>;

    /// Runs forward/backward on one micro-batch and accumulates its gradients.
    ///
    /// # Errors
    /// Returns an `EngineError` if execution fails.
    async fn forward_backward(
        &self,
        batch: &MicroBatch,
        plan: &DispatchPlan,
        step: &StepContext,
    ) -> Result<MicroBatchOutcome, EngineError>;

    /// Applies the accumulated gradients. This is the data-parallel barrier:
    /// it returns only once every replica has applied the same update.
    ///
    /// # Errors
    /// Returns an `EngineError` if the update fails.
    async fn apply_update(&self, step: &StepContext) -> Result<UpdateOutcome, EngineError>;

    /// Micro-batches whose gradients are currently accumulated and not yet
    /// applied. Queried before every `apply_update`.
    ///
    /// # Errors
    /// Returns an `EngineError` if the gradient buffers cannot be inspected.
    async fn accumulated_micro_batches(&self) -> Result<u64, EngineError>;

    /// Drops accumulated gradients without touching parameters, returning
    /// how many micro-batches were discarded.
    ///
    /// # Errors
    /// Returns an `EngineError` if the gradient buffers cannot be reset.
    async fn discard_accumulated(&self) -> Result<u64, EngineError>;

    /// Evaluates one validation batch. Must not mutate parameters.
    ///
    /// # Errors
    /// Returns an `EngineError` if evaluation fails.
    async fn evaluate(&self, batch: &MicroBatch, plan: &DispatchPlan) -> Result<EvalOutcome, EngineError>;

    /// Broadcasts the local view of the run state and returns the view the
    /// workers agreed on.
    ///
    /// # Errors
    /// Returns an `EngineError` if the collective fails.
    async fn synchronize(&self, point: &SyncPoint) -> Result<SyncPoint, EngineError>;

    /// Serializes parameters and optimizer state. Opaque to the coordinator.
    ///
    /// # Errors
    /// Returns an `EngineError` if the state cannot be exported.
    async fn export_state(&self) -> Result<Vec<u8>, EngineError>;

    /// Restores state previously produced by `export_state`.
    ///
    /// # Errors
    /// Returns an `EngineError` if the bytes are rejected.
    async fn import_state(&self, state: &[u8]) -> Result<(), EngineError>;
}

/// The external data-loading subsystem.
#[async_trait]
pub trait BatchLoader: Send + Sync {
    /// Materializes the samples behind a shard reference.
    ///
    /// # Errors
    /// Returns a `LoaderError`; transient errors may be retried by the caller.
    async fn load(&self, reference: &ShardRef, context_length: usize) -> Result<MicroBatch, LoaderError>;
}

/// The evaluation/metrics reporting interface.
///
/// Sinks are best-effort: callers log and drop errors instead of aborting.
pub trait MetricsSink: Send + Sync {
    /// Records one metrics record.
    ///
    /// # Errors
    /// Returns a `SinkError` if the record could not be delivered.
    fn record(&self, record: &MetricsRecord) -> Result<(), SinkError>;
}
