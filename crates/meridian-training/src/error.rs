use meridian_abstraction::EngineError;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("uneven shard: batch_size {batch_size} is not divisible by dp_devices {dp_devices}")]
    UnevenShard { batch_size: usize, dp_devices: usize },

    #[error("accumulation underflow: engine consumed {observed} micro-batches, expected {expected}")]
    AccumulationUnderflow { expected: u64, observed: u64 },

    #[error("index corrupt ({origin}): {reason}")]
    IndexCorrupt { origin: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "mesh mismatch: mesh {dp_devices}x{mp_devices} needs {} devices, {available} available",
        .dp_devices * .mp_devices
    )]
    MeshMismatch { dp_devices: usize, mp_devices: usize, available: usize },

    #[error("warm start snapshot unavailable: {0}")]
    WarmStart(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("shard read failed after {attempts} attempt(s): {message}")]
    ShardRead { attempts: u32, message: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub(crate) fn index_corrupt(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IndexCorrupt { origin: origin.into(), reason: reason.into() }
    }

    /// Stable name of the invariant this error reports, used in diagnostics.
    #[must_use]
    pub fn invariant(&self) -> &'static str {
        match self {
            Self::InvalidSchedule(_) => "InvalidSchedule",
            Self::UnevenShard { .. } => "UnevenShard",
            Self::AccumulationUnderflow { .. } => "AccumulationUnderflow",
            Self::IndexCorrupt { .. } => "IndexCorrupt",
            Self::InvalidConfig(_) | Self::Yaml(_) | Self::Toml(_) => "InvalidConfig",
            Self::MeshMismatch { .. } => "MeshMismatch",
            Self::WarmStart(_) => "WarmStart",
            Self::Checkpoint(_) => "Checkpoint",
            Self::ShardRead { .. } => "ShardRead",
            Self::Engine(_) => "Engine",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "Io",
        }
    }
}
