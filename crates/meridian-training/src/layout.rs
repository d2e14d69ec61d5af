use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const STATE_FILE: &str = "state.json";
pub const ENGINE_FILE: &str = "engine.bin";
pub const MANIFEST_FILE: &str = "manifest.json";

const STEP_PREFIX: &str = "step_";
const STAGING_PREFIX: &str = ".tmp-";
const TRASH_PREFIX: &str = ".trash-";

/// Filesystem layout of a checkpoint directory.
///
/// ```text
/// <root>/step_0000001000/{state.json, engine.bin, manifest.json}
/// <root>/.tmp-<uuid>/      staging, renamed into place when complete
/// <root>/.trash-<uuid>/    a replaced step directory awaiting removal
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    root: PathBuf,
}

impl CheckpointLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn step_dir(&self, step: u64) -> PathBuf {
        self.root.join(step_dir_name(step))
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(format!("{TRASH_PREFIX}{}", Uuid::new_v4()))
    }
}

#[must_use]
pub fn step_dir_name(step: u64) -> String {
    format!("{STEP_PREFIX}{step:010}")
}

/// Step encoded in a published directory name, if it is one.
#[must_use]
pub fn parse_step_dir(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(STEP_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A step directory moved aside while its replacement was renamed in.
#[must_use]
pub fn is_trash_dir(name: &str) -> bool {
    name.starts_with(TRASH_PREFIX)
}

/// Leftover staging or trash directory from an interrupted publish.
#[must_use]
pub fn is_scratch_dir(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX)
}
