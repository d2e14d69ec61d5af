//! Step → learning rate / context length.
//!
//! Everything here is a pure function of the configuration the engine was
//! built from and the step passed in. Every worker evaluating the same step
//! gets bit-identical values.

use crate::config::ManifestConfig;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};

/// Inputs to the schedule, extracted from the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleParams {
    pub peak_learning_rate: f64,
    pub end_learning_rate: f64,
    pub warmup_steps: u64,
    pub decay_steps: u64,
    pub total_steps: u64,
    pub staged_warmup_steps: u64,
    pub warmup_train_context: usize,
    pub max_context: usize,
    pub batch_size: usize,
    pub gradient_accumulation_steps: u64,
}

/// Which context-length stage a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurriculumStage {
    /// Reduced context (`warmup_train_context`).
    Warmup,
    /// Full context (`max_context`).
    Full,
}

/// All schedule values for one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSchedule {
    pub step: u64,
    pub learning_rate: f64,
    pub context_length: usize,
    pub stage: CurriculumStage,
}

/// Linear warmup followed by cosine decay to `end_learning_rate`, then hold.
///
/// With `p = (step - warmup_steps) / (decay_steps - warmup_steps)` the decay
/// phase is `end + (peak - end) * (1 + cos(pi * p)) / 2`.
#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    params: ScheduleParams,
}

impl ScheduleEngine {
    pub fn new(params: ScheduleParams) -> TrainingResult<Self> {
        let p = &params;

        let bounds = [("peak_learning_rate", p.peak_learning_rate), ("end_learning_rate", p.end_learning_rate)];
        for (name, value) in bounds {
            if !value.is_finite() || value < 0.0 {
                return Err(TrainingError::InvalidSchedule(format!("{name} must be finite and >= 0, got {value}")));
            }
        }
        if p.end_learning_rate > p.peak_learning_rate {
            return Err(TrainingError::InvalidSchedule(format!(
                "end_learning_rate {} exceeds peak_learning_rate {}",
                p.end_learning_rate, p.peak_learning_rate
            )));
        }
        if p.warmup_steps >= p.decay_steps {
            return Err(TrainingError::InvalidSchedule(format!(
                "warmup_steps {} must be below decay_steps {}",
                p.warmup_steps, p.decay_steps
            )));
        }
        if p.decay_steps > p.total_steps {
            return Err(TrainingError::InvalidSchedule(format!(
                "decay_steps {} exceeds total_steps {}",
                p.decay_steps, p.total_steps
            )));
        }
        if p.max_context == 0 || p.warmup_train_context == 0 {
            return Err(TrainingError::InvalidSchedule("context lengths must be >= 1".to_string()));
        }
        if p.max_context < p.warmup_train_context {
            return Err(TrainingError::InvalidSchedule(format!(
                "max_context {} is shorter than warmup_train_context {}",
                p.max_context, p.warmup_train_context
            )));
        }

        Ok(Self { params })
    }

    pub fn from_config(config: &ManifestConfig) -> TrainingResult<Self> {
        let t = &config.training;
        Self::new(ScheduleParams {
            peak_learning_rate: t.peak_learning_rate,
            end_learning_rate: t.end_learning_rate,
            warmup_steps: t.warmup_steps,
            decay_steps: t.decay_steps,
            total_steps: t.total_steps,
            staged_warmup_steps: t.staged_warmup_steps,
            warmup_train_context: t.warmup_train_context,
            max_context: config.data.max_context,
            batch_size: t.batch_size,
            gradient_accumulation_steps: t.gradient_accumulation_steps,
        })
    }

    #[must_use]
    pub fn params(&self) -> &ScheduleParams {
        &self.params
    }

    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.params.total_steps
    }

    pub fn learning_rate(&self, step: u64) -> f64 {
        let p = &self.params;

        if step < p.warmup_steps {
            return p.peak_learning_rate * step as f64 / p.warmup_steps as f64;
        }
        if step >= p.decay_steps {
            return p.end_learning_rate;
        }

        let progress = (step - p.warmup_steps) as f64 / (p.decay_steps - p.warmup_steps) as f64;
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        p.end_learning_rate + (p.peak_learning_rate - p.end_learning_rate) * cosine
    }

    pub fn curriculum_stage(&self, step: u64) -> CurriculumStage {
        if step < self.params.staged_warmup_steps {
            CurriculumStage::Warmup
        } else {
            CurriculumStage::Full
        }
    }

    pub fn active_context_length(&self, step: u64) -> usize {
        match self.curriculum_stage(step) {
            CurriculumStage::Warmup => self.params.warmup_train_context,
            CurriculumStage::Full => self.params.max_context,
        }
    }

    pub fn at(&self, step: u64) -> StepSchedule {
        StepSchedule {
            step,
            learning_rate: self.learning_rate(step),
            context_length: self.active_context_length(step),
            stage: self.curriculum_stage(step),
        }
    }

    /// Whether `step` optimizer updates complete the run.
    pub fn is_complete(&self, step: u64) -> bool {
        step >= self.params.total_steps
    }

    /// Tokens processed by the first `step` optimizer updates.
    pub fn tokens_seen(&self, step: u64) -> u64 {
        let p = &self.params;
        let short = step.min(p.staged_warmup_steps);
        let full = step - short;
        let per_update = (p.batch_size as u64).saturating_mul(p.gradient_accumulation_steps);
        let positions = short
            .saturating_mul(p.warmup_train_context as u64)
            .saturating_add(full.saturating_mul(p.max_context as u64));
        positions.saturating_mul(per_update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ScheduleParams {
        ScheduleParams {
            peak_learning_rate: 6e-4,
            end_learning_rate: 6e-5,
            warmup_steps: 100,
            decay_steps: 1_000,
            total_steps: 1_200,
            staged_warmup_steps: 300,
            warmup_train_context: 256,
            max_context: 1024,
            batch_size: 64,
            gradient_accumulation_steps: 8,
        }
    }

    #[test]
    fn test_decay_midpoint_is_mean_of_peak_and_end() {
        let engine = ScheduleEngine::new(params()).unwrap();
        let mid = engine.learning_rate(550);
        assert!((mid - (6e-4 + 6e-5) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_warmup_not_below_decay() {
        let mut p = params();
        p.warmup_steps = 1_000;
        assert!(matches!(ScheduleEngine::new(p), Err(TrainingError::InvalidSchedule(_))));
    }

    #[test]
    fn test_rejects_decay_beyond_total() {
        let mut p = params();
        p.decay_steps = 1_201;
        assert!(matches!(ScheduleEngine::new(p), Err(TrainingError::InvalidSchedule(_))));
    }

    #[test]
    fn test_rejects_negative_rate() {
        let mut p = params();
        p.end_learning_rate = -1e-5;
        assert!(matches!(ScheduleEngine::new(p), Err(TrainingError::InvalidSchedule(_))));
    }

    #[test]
    fn test_rejects_context_curriculum_that_grows_backwards() {
        let mut p = params();
        p.warmup_train_context = 2048;
        assert!(matches!(ScheduleEngine::new(p), Err(TrainingError::InvalidSchedule(_))));
    }

    #[test]
    fn test_zero_warmup_starts_at_peak() {
        let mut p = params();
        p.warmup_steps = 0;
        let engine = ScheduleEngine::new(p).unwrap();
        assert!((engine.learning_rate(0) - 6e-4).abs() < 1e-15);
    }

    #[test]
    fn test_tokens_seen_closed_form_matches_sum() {
        let engine = ScheduleEngine::new(params()).unwrap();
        let per_update = 64 * 8;
        let summed: u64 = (0..500).map(|s| engine.active_context_length(s) as u64 * per_update).sum();
        assert_eq!(engine.tokens_seen(500), summed);
        assert_eq!(engine.tokens_seen(0), 0);
    }

    #[test]
    fn test_is_complete_at_total_steps() {
        let engine = ScheduleEngine::new(params()).unwrap();
        assert!(!engine.is_complete(1_199));
        assert!(engine.is_complete(1_200));
        assert!((engine.learning_rate(5_000) - 6e-5).abs() < f64::EPSILON);
    }
}
