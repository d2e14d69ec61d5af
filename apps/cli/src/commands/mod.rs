//! Command implementations for the Meridian CLI.

pub mod checkpoints;
pub mod schedule;
pub mod train;
pub mod validate;

use anyhow::Context;
use meridian_training::ManifestConfig;
use std::path::Path;

/// Load a manifest and check its invariants, returning any warnings.
pub fn load_manifest(path: &Path) -> anyhow::Result<(ManifestConfig, Vec<meridian_training::ConfigWarning>)> {
    let config =
        ManifestConfig::load(path).with_context(|| format!("Failed to load manifest {}", path.display()))?;
    let warnings = config.validate().with_context(|| format!("Invalid manifest {}", path.display()))?;
    Ok((config, warnings))
}
