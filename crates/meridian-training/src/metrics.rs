//! Metrics sinks.
//!
//! Sinks are best-effort: the coordinator logs a failed `record` and keeps
//! training.

use meridian_abstraction::{MetricsKind, MetricsRecord, MetricsSink, SinkError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// `exp(loss)`, saturating at `f64::MAX` for very large losses.
#[must_use]
pub fn perplexity(loss: f64) -> f64 {
    let ppl = loss.exp();
    if ppl.is_finite() { ppl } else { f64::MAX }
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        let values = record
            .values
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        match record.kind {
            MetricsKind::Train => info!(step = record.step, kind = "train", "{values}"),
            MetricsKind::Evaluation => info!(step = record.step, kind = "evaluation", "{values}"),
        }
        Ok(())
    }
}

/// Appends records as JSON lines to a file.
#[derive(Debug)]
pub struct JsonlMetricsSink {
    file: Mutex<File>,
}

impl JsonlMetricsSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn record(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record).map_err(|e| SinkError(e.to_string()))?;
        line.push(b'\n');
        let mut file = self.file.lock().map_err(|_| SinkError("metrics file lock poisoned".to_string()))?;
        file.write_all(&line).map_err(|e| SinkError(e.to_string()))
    }
}

/// Forwards every record to each inner sink, even after one fails.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn record(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        let failures: Vec<String> =
            self.sinks.iter().filter_map(|sink| sink.record(record).err()).map(|e| e.0).collect();
        if failures.is_empty() { Ok(()) } else { Err(SinkError(failures.join("; "))) }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    records: Mutex<Vec<MetricsRecord>>,
}

impl RecordingMetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn of_kind(&self, kind: MetricsKind) -> Vec<MetricsRecord> {
        self.records().into_iter().filter(|r| r.kind == kind).collect()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn record(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .map_err(|_| SinkError("recording sink lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FailingSink;

    impl MetricsSink for FailingSink {
        fn record(&self, _record: &MetricsRecord) -> Result<(), SinkError> {
            Err(SinkError("remote unavailable".to_string()))
        }
    }

    fn record(step: u64) -> MetricsRecord {
        MetricsRecord::new(Some("proj".to_string()), step, MetricsKind::Train).with("train_loss", 2.5)
    }

    #[test]
    fn test_perplexity() {
        assert!((perplexity(0.0) - 1.0).abs() < f64::EPSILON);
        assert_eq!(perplexity(1e6), f64::MAX);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs").join("metrics.jsonl");
        let sink = JsonlMetricsSink::open(&path).unwrap();
        sink.record(&record(1)).unwrap();
        sink.record(&record(2)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<MetricsRecord> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].step, 2);
        assert_eq!(lines[0].get("train_loss"), Some(2.5));
    }

    #[test]
    fn test_fanout_delivers_past_failures() {
        let recording = Arc::new(RecordingMetricsSink::new());
        let fanout = FanoutSink::new().with(Arc::new(FailingSink)).with(recording.clone());
        assert_eq!(fanout.len(), 2);

        let err = fanout.record(&record(3)).unwrap_err();
        assert!(err.0.contains("remote unavailable"));
        assert_eq!(recording.records().len(), 1);
    }
}
