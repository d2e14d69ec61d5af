//! Atomic checkpoint store with keep-N retention.
//!
//! A checkpoint is staged in a scratch directory, every file is hashed into
//! `manifest.json`, and the directory is published with a single rename. A
//! reader therefore sees either a complete checkpoint or none at all.

use crate::artifacts::{ArtifactKind, CheckpointManifest, write_artifact};
use crate::cadence::CheckpointReason;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{
    CheckpointLayout, ENGINE_FILE, MANIFEST_FILE, STATE_FILE, is_scratch_dir, is_trash_dir, parse_step_dir,
};
use crate::state::RunState;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A published checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub step: u64,
    pub path: PathBuf,
}

/// A checkpoint read back and verified.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub path: PathBuf,
    pub manifest: CheckpointManifest,
    pub state: RunState,
    pub engine_state: Vec<u8>,
}

/// What to record alongside the opaque engine state.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointRequest<'a> {
    pub state: &'a RunState,
    pub engine_state: &'a [u8],
    pub engine_id: &'a str,
    pub config_fingerprint: &'a str,
    pub reason: CheckpointReason,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: CheckpointLayout,
    keep: usize,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(root: PathBuf, keep: usize) -> Self {
        Self { layout: CheckpointLayout::new(root), keep: keep.max(1) }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    #[must_use]
    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Stage, hash, and publish a checkpoint, then prune old ones.
    pub fn publish(&self, request: &CheckpointRequest<'_>) -> TrainingResult<CheckpointEntry> {
        std::fs::create_dir_all(self.root())?;
        let staging = self.layout.staging_dir();
        std::fs::create_dir(&staging)?;

        let staged = self.stage(&staging, request);
        let published = staged.and_then(|()| self.swap_into_place(&staging, request.state.global_step));
        if published.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        let entry = published?;

        info!(
            step = entry.step,
            reason = %request.reason,
            path = %entry.path.display(),
            "Published checkpoint"
        );
        self.prune()?;
        Ok(entry)
    }

    fn stage(&self, staging: &Path, request: &CheckpointRequest<'_>) -> TrainingResult<()> {
        let state_json = serde_json::to_vec_pretty(request.state)?;
        let artifacts = vec![
            write_artifact(staging, STATE_FILE, ArtifactKind::RunState, &state_json)?,
            write_artifact(staging, ENGINE_FILE, ArtifactKind::EngineState, request.engine_state)?,
        ];

        let manifest = CheckpointManifest {
            step: request.state.global_step,
            epoch: request.state.epoch(),
            created_at: Utc::now(),
            reason: request.reason,
            config_fingerprint: request.config_fingerprint.to_string(),
            engine_id: request.engine_id.to_string(),
            artifacts,
        };
        std::fs::write(staging.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
        Ok(())
    }

    fn swap_into_place(&self, staging: &Path, step: u64) -> TrainingResult<CheckpointEntry> {
        let target = self.layout.step_dir(step);
        if target.exists() {
            let trash = self.layout.trash_dir();
            std::fs::rename(&target, &trash)?;
            std::fs::rename(staging, &target)?;
            if let Err(e) = std::fs::remove_dir_all(&trash) {
                warn!(path = %trash.display(), error = %e, "Failed to remove replaced checkpoint");
            }
        } else {
            std::fs::rename(staging, &target)?;
        }
        Ok(CheckpointEntry { step, path: target })
    }

    /// Published checkpoints, oldest first.
    pub fn list(&self) -> TrainingResult<Vec<CheckpointEntry>> {
        let dir = match std::fs::read_dir(self.root()) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(step) = entry.file_name().to_str().and_then(parse_step_dir) {
                out.push(CheckpointEntry { step, path: entry.path() });
            }
        }
        out.sort_by_key(|e| e.step);
        Ok(out)
    }

    /// Load and verify the checkpoint for `step`.
    pub fn load(&self, step: u64) -> TrainingResult<LoadedCheckpoint> {
        let path = self.layout.step_dir(step);
        let manifest_bytes = std::fs::read(path.join(MANIFEST_FILE))
            .map_err(|e| TrainingError::Checkpoint(format!("{}: unreadable manifest: {e}", path.display())))?;
        let manifest: CheckpointManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| TrainingError::Checkpoint(format!("{}: malformed manifest: {e}", path.display())))?;

        let state_bytes = manifest.read_verified(&path, ArtifactKind::RunState)?;
        let state: RunState = serde_json::from_slice(&state_bytes)
            .map_err(|e| TrainingError::Checkpoint(format!("{}: malformed run state: {e}", path.display())))?;
        let engine_state = manifest.read_verified(&path, ArtifactKind::EngineState)?;

        if manifest.step != step || state.global_step != step {
            return Err(TrainingError::Checkpoint(format!(
                "{}: directory, manifest and state disagree on the step ({step}, {}, {})",
                path.display(),
                manifest.step,
                state.global_step
            )));
        }

        Ok(LoadedCheckpoint { path, manifest, state, engine_state })
    }

    /// Newest checkpoint that verifies, skipping corrupt ones.
    pub fn latest_valid(&self) -> TrainingResult<Option<LoadedCheckpoint>> {
        for entry in self.list()?.into_iter().rev() {
            match self.load(entry.step) {
                Ok(loaded) => return Ok(Some(loaded)),
                Err(e) => warn!(step = entry.step, error = %e, "Skipping unusable checkpoint"),
            }
        }
        Ok(None)
    }

    /// Remove all but the newest `keep` checkpoints. Returns the removed steps.
    pub fn prune(&self) -> TrainingResult<Vec<u64>> {
        let entries = self.list()?;
        let excess = entries.len().saturating_sub(self.keep);
        let mut removed = Vec::with_capacity(excess);
        for entry in entries.into_iter().take(excess) {
            std::fs::remove_dir_all(&entry.path)?;
            debug!(step = entry.step, "Pruned checkpoint");
            removed.push(entry.step);
        }
        Ok(removed)
    }

    /// Remove every checkpoint and scratch directory. Returns how many
    /// published checkpoints were removed.
    pub fn clear(&self) -> TrainingResult<usize> {
        let entries = self.list()?;
        for entry in &entries {
            std::fs::remove_dir_all(&entry.path)?;
        }
        self.sweep_scratch(false)?;
        if !entries.is_empty() {
            info!(removed = entries.len(), root = %self.root().display(), "Cleared stale checkpoints");
        }
        Ok(entries.len())
    }

    /// Tidy up after an interrupted publish. Staging directories are removed.
    /// A trash directory whose step has no published directory is the only
    /// copy of that checkpoint and is renamed back into place; any other
    /// trash is removed. Returns how many directories were removed.
    pub fn cleanup_scratch(&self) -> TrainingResult<usize> {
        self.sweep_scratch(true)
    }

    fn sweep_scratch(&self, restore_orphans: bool) -> TrainingResult<usize> {
        let dir = match std::fs::read_dir(self.root()) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_scratch_dir(name) {
                continue;
            }

            if restore_orphans
                && is_trash_dir(name)
                && let Some(step) = self.restore_orphaned_trash(&entry.path())?
            {
                warn!(step, trash = %entry.path().display(), "Restored checkpoint from an interrupted replace");
                continue;
            }
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "Removed checkpoint scratch directories");
        }
        Ok(removed)
    }

    /// Rename `trash` back to its step directory when nothing else holds
    /// that step. Returns the restored step.
    fn restore_orphaned_trash(&self, trash: &Path) -> TrainingResult<Option<u64>> {
        let Ok(bytes) = std::fs::read(trash.join(MANIFEST_FILE)) else {
            return Ok(None);
        };
        let Ok(manifest) = serde_json::from_slice::<CheckpointManifest>(&bytes) else {
            return Ok(None);
        };
        let target = self.layout.step_dir(manifest.step);
        if target.exists() {
            return Ok(None);
        }
        std::fs::rename(trash, &target)?;
        Ok(Some(manifest.step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn publish(store: &CheckpointStore, step: u64, engine: &[u8]) -> CheckpointEntry {
        let state = RunState { global_step: step, ..RunState::default() };
        store
            .publish(&CheckpointRequest {
                state: &state,
                engine_state: engine,
                engine_id: "test",
                config_fingerprint: "fp",
                reason: CheckpointReason::Cadence,
            })
            .unwrap()
    }

    #[test]
    fn test_publish_then_load() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().join("ckpt"), 3);
        let entry = publish(&store, 20, b"engine-20");

        assert!(entry.path.join(MANIFEST_FILE).exists());
        let loaded = store.load(20).unwrap();
        assert_eq!(loaded.state.global_step, 20);
        assert_eq!(loaded.engine_state, b"engine-20");
        assert_eq!(loaded.manifest.reason, CheckpointReason::Cadence);
        assert_eq!(store.cleanup_scratch().unwrap(), 0);
    }

    #[test]
    fn test_republishing_a_step_replaces_it() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().to_path_buf(), 3);
        publish(&store, 5, b"first");
        publish(&store, 5, b"second");

        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.load(5).unwrap().engine_state, b"second");
        assert_eq!(store.cleanup_scratch().unwrap(), 0);
    }

    #[test]
    fn test_interrupted_replace_restores_moved_aside_copy() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().to_path_buf(), 3);
        let entry = publish(&store, 5, b"only-copy");

        // Crash after the old directory was moved aside but before the new
        // one was renamed in.
        let trash = temp.path().join(".trash-3f2a");
        std::fs::rename(&entry.path, &trash).unwrap();
        std::fs::create_dir(temp.path().join(".tmp-3f2b")).unwrap();
        assert!(store.list().unwrap().is_empty());

        assert_eq!(store.cleanup_scratch().unwrap(), 1);
        assert!(!trash.exists());
        let restored = store.latest_valid().unwrap().unwrap();
        assert_eq!(restored.state.global_step, 5);
        assert_eq!(restored.engine_state, b"only-copy");
    }

    #[test]
    fn test_trash_with_published_counterpart_is_removed() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().to_path_buf(), 3);
        let entry = publish(&store, 5, b"old");
        let trash = temp.path().join(".trash-9c1d");
        std::fs::rename(&entry.path, &trash).unwrap();
        publish(&store, 5, b"new");

        assert_eq!(store.cleanup_scratch().unwrap(), 1);
        assert!(!trash.exists());
        assert_eq!(store.load(5).unwrap().engine_state, b"new");
    }

    #[test]
    fn test_clear_does_not_resurrect_trash() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().to_path_buf(), 3);
        let entry = publish(&store, 5, b"old");
        std::fs::rename(&entry.path, temp.path().join(".trash-77aa")).unwrap();

        assert_eq!(store.clear().unwrap(), 0);
        assert!(store.list().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_keeps_newest_n() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().to_path_buf(), 2);
        for step in [10, 20, 30, 40] {
            publish(&store, step, b"x");
        }
        let steps: Vec<_> = store.list().unwrap().into_iter().map(|e| e.step).collect();
        assert_eq!(steps, [30, 40]);
    }

    #[test]
    fn test_latest_valid_skips_corrupt_checkpoint() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().to_path_buf(), 3);
        publish(&store, 10, b"good");
        let newest = publish(&store, 20, b"good");
        std::fs::write(newest.path.join(ENGINE_FILE), b"bit rot").unwrap();

        let latest = store.latest_valid().unwrap().unwrap();
        assert_eq!(latest.state.global_step, 10);
    }

    #[test]
    fn test_clear_removes_checkpoints_and_scratch() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().to_path_buf(), 3);
        publish(&store, 1, b"x");
        publish(&store, 2, b"x");
        std::fs::create_dir(temp.path().join(".tmp-interrupted")).unwrap();
        std::fs::create_dir(temp.path().join("unrelated")).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
        assert!(!temp.path().join(".tmp-interrupted").exists());
        assert!(temp.path().join("unrelated").exists());
    }

    #[test]
    fn test_missing_root_lists_nothing() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().join("absent"), 3);
        assert!(store.list().unwrap().is_empty());
        assert!(store.latest_valid().unwrap().is_none());
    }
}
