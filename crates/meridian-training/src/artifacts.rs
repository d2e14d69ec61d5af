use crate::cadence::CheckpointReason;
use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    RunState,
    EngineState,
}

/// One file of a checkpoint, addressed relative to its step directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointArtifact {
    pub kind: ArtifactKind,
    pub file: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub step: u64,
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    /// Fingerprint of the manifest configuration that produced the run.
    pub config_fingerprint: String,
    pub engine_id: String,
    pub artifacts: Vec<CheckpointArtifact>,
}

impl CheckpointManifest {
    #[must_use]
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&CheckpointArtifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    /// Read an artifact from `dir` and check it against the recorded hash.
    pub fn read_verified(&self, dir: &Path, kind: ArtifactKind) -> TrainingResult<Vec<u8>> {
        let artifact = self.artifact(kind).ok_or_else(|| {
            TrainingError::Checkpoint(format!("step {} manifest lists no {kind:?} artifact", self.step))
        })?;

        let path = dir.join(&artifact.file);
        let bytes = std::fs::read(&path)
            .map_err(|e| TrainingError::Checkpoint(format!("failed to read {}: {e}", path.display())))?;
        let digest = sha256_bytes(&bytes);
        if digest != artifact.sha256 {
            return Err(TrainingError::Checkpoint(format!(
                "{} hash mismatch: manifest {}, on disk {digest}",
                path.display(),
                artifact.sha256
            )));
        }
        Ok(bytes)
    }
}

#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}

/// Write `bytes` to `dir/file` and describe the result.
pub fn write_artifact(dir: &Path, file: &str, kind: ArtifactKind, bytes: &[u8]) -> TrainingResult<CheckpointArtifact> {
    let path = dir.join(file);
    std::fs::write(&path, bytes)?;
    std::fs::File::open(&path)?.sync_all()?;

    Ok(CheckpointArtifact { kind, file: file.to_string(), bytes: bytes.len() as u64, sha256: sha256_file(&path)? })
}
