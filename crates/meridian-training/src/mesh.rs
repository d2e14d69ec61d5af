//! Data-parallel × model-parallel batch partitioning.
//!
//! Only the data-parallel axis splits the batch. Every model-parallel rank of
//! a replica sees that replica's full slice; how parameters and activations
//! are split along the model-parallel axis is the engine's business.

use crate::config::DeviceConfig;
use crate::error::{TrainingError, TrainingResult};
use meridian_abstraction::{DeviceAssignment, DispatchPlan, MeshCoord, ShardRef};
use std::ops::Range;

/// Per-replica view of one micro-batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerReplicaShard {
    pub batch_size: usize,
    pub per_replica_batch: usize,
    pub dp_devices: usize,
    pub mp_devices: usize,
}

impl PerReplicaShard {
    /// Sample range of the micro-batch handled by data-parallel rank `dp_rank`.
    #[must_use]
    pub fn replica_range(&self, dp_rank: usize) -> Option<Range<usize>> {
        (dp_rank < self.dp_devices).then(|| {
            let start = dp_rank * self.per_replica_batch;
            start..start + self.per_replica_batch
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshPartitioner {
    dp_devices: usize,
    mp_devices: usize,
}

impl MeshPartitioner {
    pub fn new(dp_devices: usize, mp_devices: usize) -> TrainingResult<Self> {
        if dp_devices == 0 || mp_devices == 0 {
            return Err(TrainingError::InvalidConfig(format!(
                "device mesh dimensions must be positive, got {dp_devices}x{mp_devices}"
            )));
        }
        Ok(Self { dp_devices, mp_devices })
    }

    pub fn from_config(config: &DeviceConfig) -> TrainingResult<Self> {
        Self::new(config.dp_devices, config.mp_devices)
    }

    #[must_use]
    pub fn mesh_shape(&self) -> (usize, usize) {
        (self.dp_devices, self.mp_devices)
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.dp_devices * self.mp_devices
    }

    pub fn partition(&self, batch_size: usize) -> TrainingResult<PerReplicaShard> {
        if batch_size % self.dp_devices != 0 {
            return Err(TrainingError::UnevenShard { batch_size, dp_devices: self.dp_devices });
        }
        Ok(PerReplicaShard {
            batch_size,
            per_replica_batch: batch_size / self.dp_devices,
            dp_devices: self.dp_devices,
            mp_devices: self.mp_devices,
        })
    }

    pub fn validate_device_count(&self, available: usize) -> TrainingResult<()> {
        if available == self.world_size() {
            Ok(())
        } else {
            Err(TrainingError::MeshMismatch { dp_devices: self.dp_devices, mp_devices: self.mp_devices, available })
        }
    }

    #[must_use]
    pub fn device_ordinal(&self, coord: MeshCoord) -> usize {
        coord.dp_rank * self.mp_devices + coord.mp_rank
    }

    #[must_use]
    pub fn coord_for_ordinal(&self, ordinal: usize) -> Option<MeshCoord> {
        (ordinal < self.world_size()).then(|| MeshCoord {
            dp_rank: ordinal / self.mp_devices,
            mp_rank: ordinal % self.mp_devices,
        })
    }

    /// Assign every device in the mesh its slice of the samples behind
    /// `reference`.
    pub fn dispatch_plan(&self, reference: &ShardRef) -> TrainingResult<DispatchPlan> {
        let samples = usize::try_from(reference.samples()).map_err(|_| {
            TrainingError::InvalidConfig(format!("{} samples do not fit one micro-batch", reference.samples()))
        })?;
        self.plan_for_batch(samples)
    }

    /// Dispatch plan for any micro-batch of `batch_size` samples.
    pub fn plan_for_batch(&self, batch_size: usize) -> TrainingResult<DispatchPlan> {
        let shard = self.partition(batch_size)?;
        let assignments = (0..self.world_size())
            .filter_map(|ordinal| self.coord_for_ordinal(ordinal))
            .map(|coord| DeviceAssignment {
                coord,
                device_ordinal: self.device_ordinal(coord),
                sample_offset: coord.dp_rank * shard.per_replica_batch,
                sample_count: shard.per_replica_batch,
            })
            .collect();

        Ok(DispatchPlan {
            dp_devices: self.dp_devices,
            mp_devices: self.mp_devices,
            per_replica_batch: shard.per_replica_batch,
            assignments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_abstraction::ShardSpan;

    #[test]
    fn test_partition_64_over_32_replicas() {
        let mesh = MeshPartitioner::new(32, 1).unwrap();
        let shard = mesh.partition(64).unwrap();
        assert_eq!(shard.per_replica_batch, 2);
        assert_eq!(shard.replica_range(31), Some(62..64));
        assert_eq!(shard.replica_range(32), None);
    }

    #[test]
    fn test_partition_64_over_3_replicas_is_uneven() {
        let mesh = MeshPartitioner::new(3, 1).unwrap();
        assert!(matches!(
            mesh.partition(64),
            Err(TrainingError::UnevenShard { batch_size: 64, dp_devices: 3 })
        ));
    }

    #[test]
    fn test_model_parallel_axis_does_not_split_batch() {
        let mesh = MeshPartitioner::new(2, 4).unwrap();
        assert_eq!(mesh.mesh_shape(), (2, 4));
        assert_eq!(mesh.partition(16).unwrap().per_replica_batch, 8);

        let plan = mesh.plan_for_batch(16).unwrap();
        assert_eq!(plan.assignments.len(), 8);
        for a in &plan.assignments {
            assert_eq!(a.sample_count, 8);
            assert_eq!(a.sample_offset, a.coord.dp_rank * 8);
        }
        let last = plan.assignment(MeshCoord { dp_rank: 1, mp_rank: 3 }).unwrap();
        assert_eq!(last.device_ordinal, 7);
    }

    fn reference(lens: &[u64]) -> ShardRef {
        let spans = lens
            .iter()
            .enumerate()
            .map(|(shard, &len)| ShardSpan { shard, location: format!("shard-{shard}"), offset: 0, len })
            .collect();
        ShardRef { epoch: 0, first_sample: 0, spans }
    }

    #[test]
    fn test_dispatch_plan_follows_shard_reference() {
        let mesh = MeshPartitioner::new(4, 2).unwrap();
        let straddling = reference(&[5, 11]);
        let plan = mesh.dispatch_plan(&straddling).unwrap();
        assert_eq!(plan, mesh.plan_for_batch(16).unwrap());
        assert_eq!(plan.per_replica_batch, 4);

        let last = plan.assignment(MeshCoord { dp_rank: 3, mp_rank: 1 }).unwrap();
        assert_eq!(last.sample_offset + last.sample_count, 16);

        let err = mesh.dispatch_plan(&reference(&[6])).unwrap_err();
        assert!(matches!(err, TrainingError::UnevenShard { batch_size: 6, dp_devices: 4 }));
    }

    #[test]
    fn test_device_ordinal_round_trips() {
        let mesh = MeshPartitioner::new(4, 2).unwrap();
        for ordinal in 0..mesh.world_size() {
            let coord = mesh.coord_for_ordinal(ordinal).unwrap();
            assert_eq!(mesh.device_ordinal(coord), ordinal);
        }
        assert!(mesh.coord_for_ordinal(8).is_none());
    }

    #[test]
    fn test_device_count_must_match_mesh() {
        let mesh = MeshPartitioner::new(4, 2).unwrap();
        assert!(mesh.validate_device_count(8).is_ok());
        assert!(matches!(mesh.validate_device_count(4), Err(TrainingError::MeshMismatch { available: 4, .. })));
    }

    #[test]
    fn test_rejects_empty_mesh() {
        assert!(MeshPartitioner::new(0, 1).is_err());
        assert!(MeshPartitioner::new(1, 0).is_err());
    }
}
