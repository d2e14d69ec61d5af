//! Training manifest: the hyperparameter contract a run must honor.
//!
//! The manifest is loaded once at process start. Unknown fields are ignored so
//! manifests written for other drivers still load; missing required fields
//! are fatal.

use crate::accumulation::AccumulationTracker;
use crate::cadence::CadenceScheduler;
use crate::error::{TrainingError, TrainingResult};
use crate::mesh::MeshPartitioner;
use crate::schedule::ScheduleEngine;
use meridian_abstraction::Precision;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Root of the manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub training: TrainingConfig,
    pub model: ModelConfig,
    pub data: DataConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub io: IoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub max_epochs: u64,
    /// Micro-batch size, in samples, before data-parallel sharding.
    pub batch_size: usize,
    pub peak_learning_rate: f64,
    pub warmup_steps: u64,
    pub decay_steps: u64,
    pub total_steps: u64,
    pub end_learning_rate: f64,
    pub weight_decay: f64,
    pub gradient_accumulation_steps: u64,
    pub evaluation_frequency: u64,
    pub maximum_evaluation_steps: u64,
    pub precision: Precision,
    pub staged_warmup_steps: u64,
    pub warmup_train_context: usize,
    /// Extra checkpoint cadence in optimizer steps.
    #[serde(default)]
    pub checkpoint_frequency: Option<u64>,
    /// How many published checkpoints to retain.
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_keep_checkpoints() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Named capacity tier, passed through to the engine.
    pub size: String,
    pub warm_start: bool,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub corpus: String,
    #[serde(default)]
    pub train_shard_urls: Vec<String>,
    #[serde(default)]
    pub validation_shard_urls: Vec<String>,
    pub max_context: usize,
    /// Logical samples per epoch.
    pub train_samples: u64,
    pub checkpoint_directory: PathBuf,
    #[serde(default)]
    pub index_path_train: Option<PathBuf>,
    #[serde(default)]
    pub index_path_validation: Option<PathBuf>,
    /// Root that relative index locations resolve against.
    #[serde(default)]
    pub bucket_path: Option<String>,
    /// Capacity assumed for index entries without an explicit sample count.
    #[serde(default = "default_samples_per_shard")]
    pub samples_per_shard: u64,
    /// Older home of `metrics.wandb_project`; still honored.
    #[serde(default)]
    pub wandb_project: Option<String>,
}

fn default_samples_per_shard() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub dp_devices: usize,
    pub mp_devices: usize,
    /// Devices visible to the job; must match the mesh when set.
    #[serde(default)]
    pub available_devices: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub wandb_project: Option<String>,
    /// Append metrics records as JSON lines to this file.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// Bounded retry policy for collaborator I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// A legal but suspicious configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl ManifestConfig {
    /// Load a manifest from a YAML, TOML, or JSON file (chosen by extension).
    ///
    /// Relative paths inside the manifest are resolved against the manifest's
    /// own directory.
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        let mut config = match ext.as_deref() {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> TrainingResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> TrainingResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// JSON decode failures here are manifest errors, not I/O.
    pub fn from_json_str(content: &str) -> TrainingResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| TrainingError::InvalidConfig(format!("malformed JSON manifest: {e}")))
    }

    /// Experiment-tracking project. `metrics.wandb_project` wins over the
    /// older `data.wandb_project` location.
    #[must_use]
    pub fn tracking_project(&self) -> Option<&str> {
        self.metrics
            .wandb_project
            .as_deref()
            .or(self.data.wandb_project.as_deref())
    }

    /// Anchor every relative filesystem path at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        anchor(&mut self.data.checkpoint_directory);
        if let Some(p) = self.data.index_path_train.as_mut() {
            anchor(p);
        }
        if let Some(p) = self.data.index_path_validation.as_mut() {
            anchor(p);
        }
        if let Some(p) = self.model.model_path.as_mut() {
            anchor(p);
        }
        if let Some(p) = self.metrics.log_path.as_mut() {
            anchor(p);
        }
    }

    /// Check every invariant of the manifest.
    ///
    /// Returns the warnings for values that are legal but likely unintended.
    /// Fails on the first violated invariant.
    pub fn validate(&self) -> TrainingResult<Vec<ConfigWarning>> {
        let t = &self.training;

        if t.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("training.batch_size must be >= 1".to_string()));
        }
        if t.max_epochs == 0 {
            return Err(TrainingError::InvalidConfig("training.max_epochs must be >= 1".to_string()));
        }
        if !t.weight_decay.is_finite() || t.weight_decay < 0.0 {
            return Err(TrainingError::InvalidConfig("training.weight_decay must be finite and >= 0".to_string()));
        }
        if t.keep_checkpoints == 0 {
            return Err(TrainingError::InvalidConfig("training.keep_checkpoints must be >= 1".to_string()));
        }
        if self.data.train_samples < t.batch_size as u64 {
            return Err(TrainingError::InvalidConfig(format!(
                "data.train_samples ({}) must cover at least one batch of {} samples",
                self.data.train_samples, t.batch_size
            )));
        }
        if self.data.samples_per_shard == 0 {
            return Err(TrainingError::InvalidConfig("data.samples_per_shard must be >= 1".to_string()));
        }
        if self.io.max_attempts == 0 {
            return Err(TrainingError::InvalidConfig("io.max_attempts must be >= 1".to_string()));
        }

        ScheduleEngine::from_config(self)?;
        AccumulationTracker::new(t.gradient_accumulation_steps)?;
        CadenceScheduler::from_config(t)?;

        let mesh = MeshPartitioner::from_config(&self.device)?;
        mesh.partition(t.batch_size)?;
        if let Some(available) = self.device.available_devices {
            mesh.validate_device_count(available)?;
        }

        if self.model.warm_start {
            let path = self.model.model_path.as_ref().ok_or_else(|| {
                TrainingError::WarmStart("model.warm_start is set but model.model_path is missing".to_string())
            })?;
            std::fs::File::open(path)
                .map_err(|e| TrainingError::WarmStart(format!("{}: {}", path.display(), e)))?;
        }

        Ok(self.warnings())
    }

    fn warnings(&self) -> Vec<ConfigWarning> {
        let t = &self.training;
        let mut warnings = Vec::new();

        if t.staged_warmup_steps > t.total_steps {
            warnings.push(ConfigWarning {
                field: "training.staged_warmup_steps",
                message: format!(
                    "{} exceeds total_steps {}; the short-context stage never ends within this run",
                    t.staged_warmup_steps, t.total_steps
                ),
            });
        }
        if t.evaluation_frequency > t.total_steps {
            warnings.push(ConfigWarning {
                field: "training.evaluation_frequency",
                message: format!(
                    "{} exceeds total_steps {}; no evaluation will run",
                    t.evaluation_frequency, t.total_steps
                ),
            });
        }
        if t.maximum_evaluation_steps == 0 {
            warnings.push(ConfigWarning {
                field: "training.maximum_evaluation_steps",
                message: "0 disables evaluation batches".to_string(),
            });
        }
        if self.data.validation_shard_urls.is_empty() && self.data.index_path_validation.is_none() {
            warnings.push(ConfigWarning {
                field: "data.index_path_validation",
                message: "no validation shards configured; evaluations will be skipped".to_string(),
            });
        }

        match (&self.data.wandb_project, &self.metrics.wandb_project) {
            (Some(legacy), None) => warnings.push(ConfigWarning {
                field: "data.wandb_project",
                message: format!("project {legacy:?} found under data; move it to metrics.wandb_project"),
            }),
            (Some(legacy), Some(current)) if legacy != current => warnings.push(ConfigWarning {
                field: "data.wandb_project",
                message: format!("ignored in favor of metrics.wandb_project {current:?}"),
            }),
            _ => {}
        }

        warnings
    }

    /// Content hash of every value that shapes the step schedule or the data
    /// order. A resumed run with a different fingerprint will not reproduce
    /// the interrupted run.
    pub fn fingerprint(&self) -> TrainingResult<String> {
        let t = &self.training;
        let material = serde_json::json!({
            "batch_size": t.batch_size,
            "peak_learning_rate": t.peak_learning_rate,
            "end_learning_rate": t.end_learning_rate,
            "warmup_steps": t.warmup_steps,
            "decay_steps": t.decay_steps,
            "total_steps": t.total_steps,
            "gradient_accumulation_steps": t.gradient_accumulation_steps,
            "staged_warmup_steps": t.staged_warmup_steps,
            "warmup_train_context": t.warmup_train_context,
            "max_epochs": t.max_epochs,
            "max_context": self.data.max_context,
            "train_samples": self.data.train_samples,
            "dp_devices": self.device.dp_devices,
            "mp_devices": self.device.mp_devices,
        });

        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&material)?);
        Ok(hex::encode(hasher.finalize()))
    }
}
