//! The per-step control loop.
//!
//! `RunCoordinator` pulls micro-batch references from the training cursor,
//! feeds them through the engine, turns full accumulation windows into
//! optimizer updates, and runs evaluation and checkpointing on cadence. The
//! only state it ever persists is the committed `RunState`: the step and
//! cursor as of the last applied update.

use crate::accumulation::{AccumulationTracker, MicroStepOutcome};
use crate::cadence::{CadenceScheduler, CheckpointReason};
use crate::checkpoint::{CheckpointEntry, CheckpointRequest, CheckpointStore};
use crate::config::ManifestConfig;
use crate::cursor::{TrainCursor, ValidationPartition};
use crate::error::{TrainingError, TrainingResult};
use crate::index::ShardIndex;
use crate::mesh::MeshPartitioner;
use crate::metrics::perplexity;
use crate::retry::RetryPolicy;
use crate::schedule::ScheduleEngine;
use crate::state::RunState;
use meridian_abstraction::{
    BatchLoader, EngineError, ExecutionEngine, LoaderError, MetricsKind, MetricsRecord, MetricsSink,
    MicroBatch, ShardRef, StepContext,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Cooperative cancellation flag, checked at micro-batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Discard existing checkpoints and start at step 0.
    Fresh,
    /// Continue from the newest valid checkpoint, if there is one.
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartOutcome {
    Fresh { cleared_checkpoints: usize },
    WarmStarted { cleared_checkpoints: usize },
    Resumed { step: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// `total_steps` optimizer updates have been applied.
    Completed,
    /// The training cursor ran through `max_epochs` epochs.
    EpochsExhausted,
    /// A shutdown was requested.
    Shutdown,
    /// The caller's per-invocation update limit was reached.
    UpdateLimit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorStatus {
    Idle,
    Preparing,
    Running { step: u64 },
    Evaluating { step: u64 },
    Finished(Termination),
    Failed(String),
}

/// Per-invocation knobs that are not part of the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after this many updates in this invocation.
    pub max_updates: Option<u64>,
    /// This worker's position among the processes sharing validation.
    pub worker_rank: usize,
    pub worker_count: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { max_updates: None, worker_rank: 0, worker_count: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub step: u64,
    pub batches: u64,
    pub mean_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub final_step: u64,
    pub epochs_completed: u64,
    pub termination: Termination,
    pub last_checkpoint: Option<u64>,
    pub last_evaluation: Option<EvaluationReport>,
}

pub struct RunCoordinator {
    config: ManifestConfig,
    fingerprint: String,
    schedule: ScheduleEngine,
    tracker: AccumulationTracker,
    cadence: CadenceScheduler,
    mesh: MeshPartitioner,
    cursor: TrainCursor,
    validation: Option<ValidationPartition>,
    store: CheckpointStore,
    retry: RetryPolicy,
    engine: Arc<dyn ExecutionEngine>,
    loader: Arc<dyn BatchLoader>,
    sink: Arc<dyn MetricsSink>,
    options: RunOptions,
    state: RunState,
    status: CoordinatorStatus,
    started: bool,
    last_checkpoint: Option<CheckpointEntry>,
    last_evaluation: Option<EvaluationReport>,
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("engine", &self.engine.id())
            .field("state", &self.state)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl RunCoordinator {
    /// Validate the manifest and assemble every component of the run.
    ///
    /// Nothing touches the engine or the checkpoint directory until `start`.
    pub fn new(
        config: ManifestConfig,
        engine: Arc<dyn ExecutionEngine>,
        loader: Arc<dyn BatchLoader>,
        sink: Arc<dyn MetricsSink>,
        options: RunOptions,
    ) -> TrainingResult<Self> {
        for warning in config.validate()? {
            warn!(field = warning.field, "{}", warning.message);
        }

        let t = &config.training;
        let schedule = ScheduleEngine::from_config(&config)?;
        let tracker = AccumulationTracker::new(t.gradient_accumulation_steps)?;
        let cadence = CadenceScheduler::from_config(t)?;
        let mesh = MeshPartitioner::from_config(&config.device)?;
        mesh.plan_for_batch(t.batch_size)?;

        let train_index = ShardIndex::resolve_train(&config.data)?;
        let cursor = TrainCursor::new(train_index, t.batch_size, config.data.train_samples, t.max_epochs)?;
        let validation = ShardIndex::resolve_validation(&config.data)?
            .map(|index| ValidationPartition::new(&index, options.worker_rank, options.worker_count, t.batch_size))
            .transpose()?;

        let store = CheckpointStore::new(config.data.checkpoint_directory.clone(), t.keep_checkpoints);
        let retry = RetryPolicy::from_config(&config.io);
        let fingerprint = config.fingerprint()?;
        let state = RunState::fresh(t.seed);

        Ok(Self {
            config,
            fingerprint,
            schedule,
            tracker,
            cadence,
            mesh,
            cursor,
            validation,
            store,
            retry,
            engine,
            loader,
            sink,
            options,
            state,
            status: CoordinatorStatus::Idle,
            started: false,
            last_checkpoint: None,
            last_evaluation: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ManifestConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    #[must_use]
    pub fn status(&self) -> &CoordinatorStatus {
        &self.status
    }

    #[must_use]
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    #[must_use]
    pub fn schedule(&self) -> &ScheduleEngine {
        &self.schedule
    }

    /// Prepare the engine and the committed state.
    pub async fn start(&mut self, mode: StartMode) -> TrainingResult<StartOutcome> {
        self.status = CoordinatorStatus::Preparing;
        let outcome = self.prepare(mode).await;
        match &outcome {
            Ok(o) => {
                self.started = true;
                self.status = CoordinatorStatus::Running { step: self.state.global_step };
                info!(
                    engine = self.engine.id(),
                    step = self.state.global_step,
                    epoch = self.state.epoch(),
                    outcome = ?o,
                    "Run coordinator started"
                );
            }
            Err(e) => self.status = CoordinatorStatus::Failed(e.to_string()),
        }
        outcome
    }

    async fn prepare(&mut self, mode: StartMode) -> TrainingResult<StartOutcome> {
        self.store.cleanup_scratch()?;

        let cleared = match mode {
            StartMode::Resume => match self.store.latest_valid()? {
                Some(checkpoint) => {
                    if checkpoint.manifest.config_fingerprint != self.fingerprint {
                        warn!(
                            step = checkpoint.state.global_step,
                            "Checkpoint was written under a different schedule configuration; \
                             the resumed run will not reproduce it"
                        );
                    }
                    self.engine.import_state(&checkpoint.engine_state).await?;
                    self.cursor.restore(checkpoint.state.train_cursor)?;
                    self.state = checkpoint.state;
                    self.confirm_agreement().await?;
                    self.last_checkpoint =
                        Some(CheckpointEntry { step: checkpoint.state.global_step, path: checkpoint.path });
                    return Ok(StartOutcome::Resumed { step: self.state.global_step });
                }
                None => {
                    warn!(root = %self.store.root().display(), "No valid checkpoint to resume from; starting fresh");
                    0
                }
            },
            StartMode::Fresh => self.store.clear()?,
        };

        self.state = RunState::fresh(self.config.training.seed);
        self.cursor.restore(self.state.train_cursor)?;

        if self.config.model.warm_start {
            let path = self.config.model.model_path.as_deref().ok_or_else(|| {
                TrainingError::WarmStart("model.warm_start is set but model.model_path is missing".to_string())
            })?;
            self.engine
                .load_warm_start(path)
                .await
                .map_err(|e| TrainingError::WarmStart(format!("{}: {e}", path.display())))?;
            info!(snapshot = %path.display(), "Loaded warm-start parameters");
            return Ok(StartOutcome::WarmStarted { cleared_checkpoints: cleared });
        }
        Ok(StartOutcome::Fresh { cleared_checkpoints: cleared })
    }

    /// Drive the loop until completion, epoch exhaustion, the update limit,
    /// or `shutdown`.
    pub async fn run(&mut self, shutdown: &ShutdownSignal) -> TrainingResult<RunSummary> {
        if !self.started {
            return Err(TrainingError::InvalidConfig("run coordinator must be started before running".to_string()));
        }
        match self.drive(shutdown).await {
            Ok(summary) => {
                self.status = CoordinatorStatus::Finished(summary.termination);
                Ok(summary)
            }
            Err(e) => {
                error!(invariant = e.invariant(), error = %e, "Run aborted");
                self.status = CoordinatorStatus::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn drive(&mut self, shutdown: &ShutdownSignal) -> TrainingResult<RunSummary> {
        let mut updates_this_run = 0u64;
        let mut window_loss = 0.0;
        let mut window_start = Instant::now();

        let termination = loop {
            if self.tracker.pending() == 0 {
                if self.schedule.is_complete(self.state.global_step) {
                    break Termination::Completed;
                }
                if self.options.max_updates.is_some_and(|max| updates_this_run >= max) {
                    break Termination::UpdateLimit;
                }
            }
            if shutdown.is_triggered() {
                info!(step = self.state.global_step, "Shutdown requested");
                break Termination::Shutdown;
            }
            let Some(reference) = self.cursor.next_batch_ref()? else {
                break Termination::EpochsExhausted;
            };

            let schedule = self.schedule.at(self.state.global_step);
            let step = StepContext {
                global_step: self.state.global_step,
                micro_step: self.tracker.pending(),
                learning_rate: schedule.learning_rate,
                weight_decay: self.config.training.weight_decay,
                context_length: schedule.context_length,
                precision: self.config.training.precision,
            };

            let plan = self.mesh.dispatch_plan(&reference)?;
            let batch = self.load_batch(&reference, step.context_length).await?;
            let outcome = self.engine.forward_backward(&batch, &plan, &step).await?;
            window_loss += outcome.loss;

            if self.tracker.observe_microbatch() == MicroStepOutcome::Accumulate {
                continue;
            }

            self.commit_update(&step).await?;
            updates_this_run += 1;
            self.status = CoordinatorStatus::Running { step: self.state.global_step };

            let mean_loss = window_loss / self.tracker.steps() as f64;
            self.record_train_metrics(&step, mean_loss, window_start.elapsed().as_secs_f64());
            window_loss = 0.0;

            let actions = self.cadence.post_step(self.state.global_step);
            if actions.evaluate {
                self.evaluate().await?;
            }
            if let Some(reason) = actions.checkpoint {
                self.checkpoint(reason).await?;
            }
            window_start = Instant::now();
        };

        if self.tracker.pending() > 0 {
            self.forfeit_window(termination).await?;
        }

        let final_reason = match termination {
            Termination::Completed | Termination::EpochsExhausted => CheckpointReason::Completion,
            Termination::Shutdown | Termination::UpdateLimit => CheckpointReason::Shutdown,
        };
        let already_saved = self.last_checkpoint.as_ref().is_some_and(|c| c.step == self.state.global_step);
        if !already_saved {
            self.checkpoint(final_reason).await?;
        }

        let epochs_completed = match termination {
            Termination::EpochsExhausted => self.config.training.max_epochs,
            _ => self.state.epoch(),
        };
        info!(
            step = self.state.global_step,
            epochs_completed,
            termination = ?termination,
            "Run finished"
        );

        Ok(RunSummary {
            final_step: self.state.global_step,
            epochs_completed,
            termination,
            last_checkpoint: self.last_checkpoint.as_ref().map(|c| c.step),
            last_evaluation: self.last_evaluation.clone(),
        })
    }

    /// Apply the window only if the engine holds all of it, then advance and
    /// agree on the committed state. A short window never reaches
    /// `apply_update`.
    async fn commit_update(&mut self, step: &StepContext) -> TrainingResult<()> {
        let accumulated = self.engine.accumulated_micro_batches().await?;
        if let Err(e) = self.tracker.verify_consumed(accumulated) {
            let dropped = self.engine.discard_accumulated().await?;
            self.cursor.restore(self.state.train_cursor)?;
            error!(
                step = self.state.global_step,
                expected = self.tracker.steps(),
                observed = accumulated,
                dropped,
                "Engine holds a short accumulation window; window discarded"
            );
            return Err(e);
        }

        let update = self.engine.apply_update(step).await?;
        if let Err(e) = self.tracker.verify_consumed(update.consumed_micro_batches) {
            error!(
                step = self.state.global_step,
                expected = self.tracker.steps(),
                observed = update.consumed_micro_batches,
                "Engine update disagrees with its accumulated window"
            );
            return Err(e);
        }

        self.state.global_step += 1;
        self.state.train_cursor = self.cursor.position();
        self.confirm_agreement().await?;
        debug!(
            step = self.state.global_step,
            epoch = self.state.epoch(),
            samples_consumed = self.state.train_cursor.samples_consumed,
            "Committed update"
        );
        Ok(())
    }

    async fn confirm_agreement(&self) -> TrainingResult<()> {
        let local = self.state.sync_point();
        let agreed = self.engine.synchronize(&local).await?;
        if agreed != local {
            return Err(EngineError::StateMismatch(format!("local view {local:?}, agreed view {agreed:?}")).into());
        }
        Ok(())
    }

    async fn forfeit_window(&mut self, termination: Termination) -> TrainingResult<()> {
        let pending = self.tracker.abandon_window();
        let dropped = self.engine.discard_accumulated().await?;
        self.cursor.restore(self.state.train_cursor)?;
        warn!(
            step = self.state.global_step,
            pending,
            dropped,
            termination = ?termination,
            "Discarding partial accumulation window"
        );
        Ok(())
    }

    async fn load_batch(&self, reference: &ShardRef, context_length: usize) -> TrainingResult<MicroBatch> {
        let loader = self.loader.as_ref();
        self.retry
            .run("shard load", LoaderError::is_transient, |_| async move {
                loader.load(reference, context_length).await
            })
            .await
            .map_err(|failure| TrainingError::ShardRead {
                attempts: failure.attempts,
                message: failure.error.to_string(),
            })
    }

    fn record_train_metrics(&self, step: &StepContext, mean_loss: f64, step_time: f64) {
        let project = self.config.tracking_project().map(str::to_string);
        let record = MetricsRecord::new(project, self.state.global_step, MetricsKind::Train)
            .with("train_loss", mean_loss)
            .with("train_ppl", perplexity(mean_loss))
            .with("learning_rate", step.learning_rate)
            .with("context_length", step.context_length as f64)
            .with("tokens_seen_b", self.schedule.tokens_seen(self.state.global_step) as f64 / 1e9)
            .with("step_time", step_time)
            .with("epoch", self.state.epoch() as f64);
        self.emit(&record);
    }

    fn emit(&self, record: &MetricsRecord) {
        if let Err(e) = self.sink.record(record) {
            warn!(step = record.step, error = %e, "Dropping metrics record");
        }
    }

    /// One pass over this worker's validation partition at the current step.
    ///
    /// Leaves the step, the accumulation window and the training cursor
    /// untouched. Returns `None` when there is nothing to evaluate.
    pub async fn evaluate(&mut self) -> TrainingResult<Option<EvaluationReport>> {
        let Some(partition) = self.validation.as_ref() else {
            debug!(step = self.state.global_step, "No validation shards; skipping evaluation");
            return Ok(None);
        };
        let refs = partition.pass(self.cadence.evaluation_batch_budget());
        if refs.is_empty() {
            debug!(step = self.state.global_step, "Validation partition is empty; skipping evaluation");
            return Ok(None);
        }

        let step = self.state.global_step;
        self.status = CoordinatorStatus::Evaluating { step };
        let context_length = self.config.data.max_context;
        let mut total = 0.0;
        for reference in &refs {
            let plan = self.mesh.dispatch_plan(reference)?;
            let batch = self.load_batch(reference, context_length).await?;
            total += self.engine.evaluate(&batch, &plan).await?.loss;
        }
        self.status = CoordinatorStatus::Running { step };

        let report = EvaluationReport { step, batches: refs.len() as u64, mean_loss: total / refs.len() as f64 };
        info!(step, batches = report.batches, validation_loss = report.mean_loss, "Evaluation finished");
        let project = self.config.tracking_project().map(str::to_string);
        let record = MetricsRecord::new(project, step, MetricsKind::Evaluation)
            .with("validation_loss", report.mean_loss)
            .with("validation_ppl", perplexity(report.mean_loss));
        self.emit(&record);

        self.last_evaluation = Some(report.clone());
        Ok(Some(report))
    }

    /// Persist the committed state. Only legal on an update boundary.
    pub async fn checkpoint(&mut self, reason: CheckpointReason) -> TrainingResult<CheckpointEntry> {
        self.tracker.close_window()?;
        let engine_state = self.engine.export_state().await?;

        let request = CheckpointRequest {
            state: &self.state,
            engine_state: &engine_state,
            engine_id: self.engine.id(),
            config_fingerprint: &self.fingerprint,
            reason,
        };
        let store = &self.store;
        let request = &request;
        let entry = self
            .retry
            .run("checkpoint write", |e: &TrainingError| matches!(e, TrainingError::Io(_)), |_| async move {
                store.publish(request)
            })
            .await
            .map_err(|failure| {
                TrainingError::Checkpoint(format!(
                    "write of step {} failed after {} attempt(s): {}",
                    self.state.global_step, failure.attempts, failure.error
                ))
            })?;

        self.last_checkpoint = Some(entry.clone());
        Ok(entry)
    }
}
