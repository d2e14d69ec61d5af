//! Meridian Training
//!
//! Step scheduling and distributed-execution coordination for pretraining:
//! - Learning-rate and context-length schedules (`ScheduleEngine`)
//! - Gradient accumulation and device-mesh partitioning
//! - Resumable shard iteration (`TrainCursor`, `ValidationPartition`)
//! - Atomic checkpoints with retention (`CheckpointStore`)
//! - The control loop driving an external engine (`RunCoordinator`)

pub mod accumulation;
pub mod artifacts;
pub mod cadence;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod index;
pub mod layout;
pub mod mesh;
pub mod metrics;
pub mod retry;
pub mod schedule;
pub mod state;
pub mod synthetic;

pub use accumulation::{AccumulationTracker, MicroStepOutcome};
pub use artifacts::{ArtifactKind, CheckpointArtifact, CheckpointManifest};
pub use cadence::{CadenceScheduler, CheckpointReason, PostStepActions};
pub use checkpoint::{CheckpointEntry, CheckpointRequest, CheckpointStore, LoadedCheckpoint};
pub use config::{
    ConfigWarning, DataConfig, DeviceConfig, IoConfig, ManifestConfig, MetricsConfig, ModelConfig, TrainingConfig,
};
pub use coordinator::{
    CoordinatorStatus, EvaluationReport, RunCoordinator, RunOptions, RunSummary, ShutdownSignal, StartMode,
    StartOutcome, Termination,
};
pub use cursor::{ShardCursor, TrainCursor, ValidationPartition};
pub use error::{TrainingError, TrainingResult};
pub use index::{ShardEntry, ShardIndex};
pub use layout::CheckpointLayout;
pub use mesh::{MeshPartitioner, PerReplicaShard};
pub use metrics::{FanoutSink, JsonlMetricsSink, RecordingMetricsSink, TracingMetricsSink, perplexity};
pub use retry::{RetryFailure, RetryPolicy};
pub use schedule::{CurriculumStage, ScheduleEngine, ScheduleParams, StepSchedule};
pub use state::RunState;
pub use synthetic::{SyntheticEngine, SyntheticLoader, SyntheticState};
