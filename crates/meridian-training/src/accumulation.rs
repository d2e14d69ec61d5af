//! Gradient-accumulation window tracking.

use crate::error::{TrainingError, TrainingResult};

/// What the caller must do after a micro-batch's forward/backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroStepOutcome {
    /// Keep the gradients; the window is not full yet.
    Accumulate,
    /// The window is full: apply the update and advance the global step.
    Update,
}

/// Counts micro-batches since the last optimizer update.
///
/// The counter is deliberately not persisted: a restart always begins with an
/// empty window, so a partially accumulated window is forfeited rather than
/// applied.
#[derive(Debug, Clone)]
pub struct AccumulationTracker {
    steps: u64,
    counter: u64,
}

impl AccumulationTracker {
    pub fn new(gradient_accumulation_steps: u64) -> TrainingResult<Self> {
        if gradient_accumulation_steps == 0 {
            return Err(TrainingError::InvalidConfig(
                "training.gradient_accumulation_steps must be >= 1".to_string(),
            ));
        }
        Ok(Self { steps: gradient_accumulation_steps, counter: 0 })
    }

    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Micro-batches observed in the current window, in `[0, steps)`.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.counter
    }

    /// Samples that go into one optimizer update.
    #[must_use]
    pub fn effective_batch_size(&self, batch_size: usize) -> u64 {
        batch_size as u64 * self.steps
    }

    pub fn observe_microbatch(&mut self) -> MicroStepOutcome {
        self.counter += 1;
        if self.counter == self.steps {
            self.counter = 0;
            MicroStepOutcome::Update
        } else {
            MicroStepOutcome::Accumulate
        }
    }

    /// Check the engine's account of an update against the full window.
    pub fn verify_consumed(&self, reported: u64) -> TrainingResult<()> {
        if reported == self.steps {
            Ok(())
        } else {
            Err(TrainingError::AccumulationUnderflow { expected: self.steps, observed: reported })
        }
    }

    /// Fails if a forced boundary (checkpoint, shutdown) lands mid-window.
    pub fn close_window(&self) -> TrainingResult<()> {
        if self.counter == 0 {
            Ok(())
        } else {
            Err(TrainingError::AccumulationUnderflow { expected: self.steps, observed: self.counter })
        }
    }

    /// Forget the open window, returning how many micro-batches it held.
    pub fn abandon_window(&mut self) -> u64 {
        std::mem::take(&mut self.counter)
    }
}
