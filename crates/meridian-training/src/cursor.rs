//! Resumable iteration over shard indexes.

use crate::error::{TrainingError, TrainingResult};
use crate::index::{ShardEntry, ShardIndex};
use meridian_abstraction::{ShardRef, ShardSpan};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Persisted position of the training cursor.
///
/// `shard`/`offset` name the next sample to read; `samples_consumed` counts
/// samples taken so far in `epoch` and always equals the samples held by
/// shards before `shard`, plus `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardCursor {
    pub epoch: u64,
    pub shard: usize,
    pub offset: u64,
    pub samples_consumed: u64,
}

/// Walks the training index in order, one micro-batch reference at a time.
///
/// An epoch is `train_samples` samples. A trailing partial batch is dropped:
/// as soon as the next batch would cross `train_samples` the cursor rolls to
/// the next epoch and restarts at shard 0. Once `max_epochs` epochs have
/// rolled, `next_batch_ref` returns `None`.
#[derive(Debug, Clone)]
pub struct TrainCursor {
    index: ShardIndex,
    batch_size: usize,
    train_samples: u64,
    max_epochs: u64,
    position: ShardCursor,
}

impl TrainCursor {
    pub fn new(index: ShardIndex, batch_size: usize, train_samples: u64, max_epochs: u64) -> TrainingResult<Self> {
        if batch_size == 0 || train_samples < batch_size as u64 {
            return Err(TrainingError::InvalidConfig(format!(
                "train_samples {train_samples} cannot hold a batch of {batch_size}"
            )));
        }
        let capacity = index.total_samples();
        if capacity < train_samples {
            return Err(TrainingError::index_corrupt(
                index.origin(),
                format!("index holds {capacity} samples, epoch needs {train_samples}"),
            ));
        }
        Ok(Self { index, batch_size, train_samples, max_epochs, position: ShardCursor::default() })
    }

    #[must_use]
    pub fn position(&self) -> ShardCursor {
        self.position
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.position.epoch
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.position.epoch >= self.max_epochs
    }

    #[must_use]
    pub fn batches_per_epoch(&self) -> u64 {
        self.train_samples / self.batch_size as u64
    }

    /// Jump to a persisted position, rejecting ones this index cannot produce.
    pub fn restore(&mut self, cursor: ShardCursor) -> TrainingResult<()> {
        let corrupt = |reason: String| TrainingError::index_corrupt(self.index.origin(), reason);

        if cursor.epoch > self.max_epochs {
            return Err(corrupt(format!("cursor epoch {} beyond max_epochs {}", cursor.epoch, self.max_epochs)));
        }
        if cursor.samples_consumed + self.batch_size as u64 > self.train_samples {
            return Err(corrupt(format!(
                "cursor has consumed {} of {} samples; the epoch should already have rolled",
                cursor.samples_consumed, self.train_samples
            )));
        }

        let shard_ok = match self.index.get(cursor.shard) {
            Some(entry) => cursor.offset < entry.samples,
            None => false,
        };
        if !shard_ok {
            return Err(corrupt(format!("cursor shard {} offset {} is outside the index", cursor.shard, cursor.offset)));
        }
        let expected = self.index.samples_before(cursor.shard) + cursor.offset;
        if expected != cursor.samples_consumed {
            return Err(corrupt(format!(
                "cursor position implies {expected} consumed samples, recorded {}",
                cursor.samples_consumed
            )));
        }

        self.position = cursor;
        debug!(epoch = cursor.epoch, shard = cursor.shard, offset = cursor.offset, "Restored train cursor");
        Ok(())
    }

    pub fn next_batch_ref(&mut self) -> TrainingResult<Option<ShardRef>> {
        if self.is_exhausted() {
            return Ok(None);
        }

        let first_sample = self.position.samples_consumed;
        let mut remaining = self.batch_size as u64;
        let mut spans = Vec::new();
        let mut shard = self.position.shard;
        let mut offset = self.position.offset;

        while remaining > 0 {
            let entry = self.index.get(shard).ok_or_else(|| {
                TrainingError::index_corrupt(self.index.origin(), format!("ran past the last shard at ordinal {shard}"))
            })?;
            let take = remaining.min(entry.samples - offset);
            spans.push(span(entry, offset, take));
            remaining -= take;
            offset += take;
            if offset == entry.samples {
                shard += 1;
                offset = 0;
            }
        }

        let reference = ShardRef { epoch: self.position.epoch, first_sample, spans };
        self.position.shard = shard;
        self.position.offset = offset;
        self.position.samples_consumed += self.batch_size as u64;

        if self.position.samples_consumed + self.batch_size as u64 > self.train_samples {
            let finished = self.position.epoch;
            self.position = rewound(finished + 1);
            info!(
                epoch = finished,
                dropped_samples = self.train_samples % self.batch_size as u64,
                "Epoch complete; rewinding shard cursor"
            );
        }

        Ok(Some(reference))
    }
}

fn rewound(epoch: u64) -> ShardCursor {
    ShardCursor { epoch, ..ShardCursor::default() }
}

fn span(entry: &ShardEntry, offset: u64, len: u64) -> ShardSpan {
    ShardSpan { shard: entry.ordinal, location: entry.location.clone(), offset, len }
}

/// One worker's slice of the validation shards.
///
/// Shard `i` belongs to worker `i % worker_count`, so the partitions of all
/// workers are disjoint and together cover the index.
#[derive(Debug, Clone)]
pub struct ValidationPartition {
    shards: Vec<ShardEntry>,
    batch_size: usize,
}

impl ValidationPartition {
    pub fn new(index: &ShardIndex, worker_rank: usize, worker_count: usize, batch_size: usize) -> TrainingResult<Self> {
        if worker_count == 0 || worker_rank >= worker_count {
            return Err(TrainingError::InvalidConfig(format!(
                "worker rank {worker_rank} is outside a pool of {worker_count}"
            )));
        }
        if batch_size == 0 {
            return Err(TrainingError::InvalidConfig("validation batch size must be >= 1".to_string()));
        }
        let shards = index.entries().iter().filter(|e| e.ordinal % worker_count == worker_rank).cloned().collect();
        Ok(Self { shards, batch_size })
    }

    #[must_use]
    pub fn shards(&self) -> &[ShardEntry] {
        &self.shards
    }

    /// Batch references for one evaluation pass, always from the partition
    /// start, at most `budget` of them. Trailing partial batches are dropped.
    #[must_use]
    pub fn pass(&self, budget: u64) -> Vec<ShardRef> {
        let batch = self.batch_size as u64;
        let mut refs = Vec::new();
        let mut spans = Vec::new();
        let mut pending = 0u64;
        let mut first_sample = 0u64;

        'shards: for entry in &self.shards {
            let mut offset = 0;
            while offset < entry.samples {
                if refs.len() as u64 >= budget {
                    break 'shards;
                }
                let take = (batch - pending).min(entry.samples - offset);
                spans.push(span(entry, offset, take));
                offset += take;
                pending += take;
                if pending == batch {
                    refs.push(ShardRef { epoch: 0, first_sample, spans: std::mem::take(&mut spans) });
                    first_sample += batch;
                    pending = 0;
                }
            }
        }

        refs
    }
}
