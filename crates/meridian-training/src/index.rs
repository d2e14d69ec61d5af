//! Shard index files.
//!
//! An index lists one shard per line:
//!
//! ```text
//! # comment
//! train/shard-00000.tar
//! train/shard-00001.tar 8192
//! ```
//!
//! The optional second column is the shard's sample count; entries without
//! one get the configured `samples_per_shard`.

use crate::config::DataConfig;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    /// Position in the index, stable across restarts.
    pub ordinal: usize,
    pub location: String,
    pub samples: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIndex {
    origin: String,
    entries: Vec<ShardEntry>,
}

impl ShardIndex {
    pub fn parse(
        contents: &str,
        origin: &str,
        default_samples: u64,
        bucket_path: Option<&str>,
    ) -> TrainingResult<Self> {
        let mut entries = Vec::new();

        for (line_no, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let location = fields.next().unwrap_or_default();
            let samples = match fields.next() {
                None => default_samples,
                Some(count) => count.parse::<u64>().map_err(|_| {
                    TrainingError::index_corrupt(origin, format!("line {}: bad sample count {count:?}", line_no + 1))
                })?,
            };
            if fields.next().is_some() {
                return Err(TrainingError::index_corrupt(
                    origin,
                    format!("line {}: expected `location [samples]`", line_no + 1),
                ));
            }
            if samples == 0 {
                return Err(TrainingError::index_corrupt(origin, format!("line {}: shard has no samples", line_no + 1)));
            }

            let location = resolve_location(location, bucket_path);
            entries.push(ShardEntry { ordinal: entries.len(), location, samples });
        }

        if entries.is_empty() {
            return Err(TrainingError::index_corrupt(origin, "index lists no shards"));
        }

        Ok(Self { origin: origin.to_string(), entries })
    }

    pub fn load(path: &Path, default_samples: u64, bucket_path: Option<&str>) -> TrainingResult<Self> {
        let origin = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|e| TrainingError::index_corrupt(&origin, e.to_string()))?;
        Self::parse(&contents, &origin, default_samples, bucket_path)
    }

    pub fn from_urls(
        urls: &[String],
        origin: &str,
        default_samples: u64,
        bucket_path: Option<&str>,
    ) -> TrainingResult<Self> {
        Self::parse(&urls.join("\n"), origin, default_samples, bucket_path)
    }

    /// Training shards: the manifest's URL list when present, else the index file.
    pub fn resolve_train(data: &DataConfig) -> TrainingResult<Self> {
        Self::resolve(&data.train_shard_urls, data.index_path_train.as_deref(), "train", data)?.ok_or_else(|| {
            TrainingError::InvalidConfig(
                "no training shards: set data.train_shard_urls or data.index_path_train".to_string(),
            )
        })
    }

    /// Validation shards, if any are configured.
    pub fn resolve_validation(data: &DataConfig) -> TrainingResult<Option<Self>> {
        Self::resolve(&data.validation_shard_urls, data.index_path_validation.as_deref(), "validation", data)
    }

    fn resolve(
        urls: &[String],
        index_path: Option<&Path>,
        split: &str,
        data: &DataConfig,
    ) -> TrainingResult<Option<Self>> {
        let bucket = data.bucket_path.as_deref();
        if !urls.is_empty() {
            let origin = format!("data.{split}_shard_urls");
            return Self::from_urls(urls, &origin, data.samples_per_shard, bucket).map(Some);
        }
        index_path.map(|path| Self::load(path, data.samples_per_shard, bucket)).transpose()
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, ordinal: usize) -> Option<&ShardEntry> {
        self.entries.get(ordinal)
    }

    #[must_use]
    pub fn entries(&self) -> &[ShardEntry] {
        &self.entries
    }

    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.entries.iter().map(|e| e.samples).sum()
    }

    /// Samples held by the shards before `ordinal`.
    #[must_use]
    pub fn samples_before(&self, ordinal: usize) -> u64 {
        self.entries.iter().take(ordinal).map(|e| e.samples).sum()
    }
}

fn resolve_location(location: &str, bucket_path: Option<&str>) -> String {
    match bucket_path {
        Some(bucket) if !location.contains("://") && !location.starts_with('/') => {
            format!("{}/{}", bucket.trim_end_matches('/'), location)
        }
        _ => location.to_string(),
    }
}
