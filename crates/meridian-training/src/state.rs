use crate::cursor::ShardCursor;
use meridian_abstraction::SyncPoint;
use serde::{Deserialize, Serialize};

/// Everything needed to continue a run, apart from the engine's own state.
///
/// Values are only ever taken at an optimizer-update boundary, so the cursor
/// here is always the committed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunState {
    pub global_step: u64,
    pub train_cursor: ShardCursor,
    #[serde(default)]
    pub seed: u64,
}

impl RunState {
    #[must_use]
    pub fn fresh(seed: u64) -> Self {
        Self { seed, ..Self::default() }
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.train_cursor.epoch
    }

    #[must_use]
    pub fn sync_point(&self) -> SyncPoint {
        SyncPoint {
            global_step: self.global_step,
            epoch: self.train_cursor.epoch,
            samples_consumed: self.train_cursor.samples_consumed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_json_shape() {
        let state = RunState {
            global_step: 42,
            train_cursor: ShardCursor { epoch: 1, shard: 3, offset: 7, samples_consumed: 307 },
            seed: 9,
        };
        let value = serde_json::to_value(state).unwrap();
        assert_eq!(value["global_step"], 42);
        assert_eq!(value["train_cursor"]["shard"], 3);

        let back: RunState = serde_json::from_value(value).unwrap();
        assert_eq!(back.sync_point(), SyncPoint { global_step: 42, epoch: 1, samples_consumed: 307 });
    }
}
