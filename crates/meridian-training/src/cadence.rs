//! When to evaluate and when to checkpoint.

use crate::config::TrainingConfig;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Cadence,
    Evaluation,
    Shutdown,
    Completion,
}

impl fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cadence => "cadence",
            Self::Evaluation => "evaluation",
            Self::Shutdown => "shutdown",
            Self::Completion => "completion",
        };
        f.write_str(s)
    }
}

/// Work owed after an optimizer update lands on a given step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostStepActions {
    pub evaluate: bool,
    pub checkpoint: Option<CheckpointReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceScheduler {
    evaluation_frequency: u64,
    maximum_evaluation_steps: u64,
    checkpoint_frequency: Option<u64>,
}

impl CadenceScheduler {
    pub fn new(
        evaluation_frequency: u64,
        maximum_evaluation_steps: u64,
        checkpoint_frequency: Option<u64>,
    ) -> TrainingResult<Self> {
        if evaluation_frequency == 0 {
            return Err(TrainingError::InvalidConfig("training.evaluation_frequency must be >= 1".to_string()));
        }
        if checkpoint_frequency == Some(0) {
            return Err(TrainingError::InvalidConfig("training.checkpoint_frequency must be >= 1".to_string()));
        }
        Ok(Self { evaluation_frequency, maximum_evaluation_steps, checkpoint_frequency })
    }

    pub fn from_config(config: &TrainingConfig) -> TrainingResult<Self> {
        Self::new(config.evaluation_frequency, config.maximum_evaluation_steps, config.checkpoint_frequency)
    }

    /// Step 0 never evaluates.
    #[must_use]
    pub fn should_evaluate(&self, step: u64) -> bool {
        step > 0 && step % self.evaluation_frequency == 0
    }

    /// Upper bound on validation batches per evaluation pass.
    #[must_use]
    pub fn evaluation_batch_budget(&self) -> u64 {
        self.maximum_evaluation_steps
    }

    #[must_use]
    pub fn should_checkpoint(&self, step: u64) -> Option<CheckpointReason> {
        if self.should_evaluate(step) {
            return Some(CheckpointReason::Evaluation);
        }
        match self.checkpoint_frequency {
            Some(freq) if step > 0 && step % freq == 0 => Some(CheckpointReason::Cadence),
            _ => None,
        }
    }

    #[must_use]
    pub fn post_step(&self, step: u64) -> PostStepActions {
        PostStepActions { evaluate: self.should_evaluate(step), checkpoint: self.should_checkpoint(step) }
    }
}
