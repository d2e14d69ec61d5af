//! Integration tests for `meridian train`.

mod common;

use common::{meridian, run_json, write_manifest};
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_train_runs_to_completion() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    let report = run_json(&["train"], &manifest);
    assert_eq!(report["start"]["kind"], "fresh");
    assert_eq!(report["summary"]["termination"], "completed");
    assert_eq!(report["summary"]["final_step"], 24);
    assert_eq!(report["summary"]["epochs_completed"], 2);
    assert_eq!(report["summary"]["last_checkpoint"], 24);
    assert_eq!(report["summary"]["last_evaluation"]["step"], 20);
    assert!(temp.path().join("checkpoints/step_0000000024/manifest.json").exists());
}

#[test]
fn test_train_resume_continues_from_last_checkpoint() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    let first = run_json(&["train", "--max-updates", "7"], &manifest);
    assert_eq!(first["summary"]["termination"], "update_limit");
    assert_eq!(first["summary"]["final_step"], 7);

    let resumed = run_json(&["train", "--resume"], &manifest);
    assert_eq!(resumed["start"]["kind"], "resumed");
    assert_eq!(resumed["start"]["step"], 7);
    assert_eq!(resumed["summary"]["final_step"], 24);
}

#[test]
fn test_fresh_train_clears_previous_checkpoints() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    run_json(&["train", "--max-updates", "7"], &manifest);
    let again = run_json(&["train", "--max-updates", "1"], &manifest);
    assert_eq!(again["start"]["kind"], "fresh");
    assert_eq!(again["start"]["cleared_checkpoints"], 2);
}

#[test]
fn test_train_appends_metrics_log() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    run_json(&["train", "--max-updates", "3"], &manifest);
    let log = std::fs::read_to_string(temp.path().join("metrics.jsonl")).unwrap();
    let records: Vec<serde_json::Value> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["step"], 1);
    assert_eq!(records[2]["step"], 3);
}

#[test]
fn test_train_human_summary_suggests_resume() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    meridian()
        .args(["train", "--max-updates", "2", "--config"])
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Training paused at update limit"))
        .stdout(predicate::str::contains("--resume"));
}

#[test]
fn test_train_rejects_mesh_mismatch() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[("mp_devices: 1", "mp_devices: 1\n  available_devices: 8")]);

    meridian()
        .args(["train", "--config"])
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("MeshMismatch"));
    assert!(!temp.path().join("checkpoints").exists());
}
