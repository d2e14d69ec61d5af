//! Integration tests for `meridian validate`.

mod common;

use common::{meridian, run_json, write_manifest};
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_validate_reports_run_shape() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    let shape = run_json(&["validate"], &manifest);
    assert_eq!(shape["train_shards"], 2);
    assert_eq!(shape["train_capacity"], 80);
    assert_eq!(shape["validation_shards"], 2);
    assert_eq!(shape["batches_per_epoch"], 20);
    assert_eq!(shape["effective_batch_size"], 8);
    assert_eq!(shape["per_replica_batch"], 2);
    assert_eq!(shape["world_size"], 2);
    assert_eq!(shape["total_steps"], 24);
    assert_eq!(shape["warnings"].as_array().unwrap().len(), 0);
}

#[test]
fn test_validate_human_output() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    meridian()
        .arg("validate")
        .arg("--config")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Manifest is valid"))
        .stdout(predicate::str::contains("Batches per epoch: 20"));
}

#[test]
fn test_validate_surfaces_warnings() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[("staged_warmup_steps: 6", "staged_warmup_steps: 40")]);

    let shape = run_json(&["validate"], &manifest);
    let warnings = shape["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].as_str().unwrap().contains("training.staged_warmup_steps"));
}

#[test]
fn test_uneven_shard_exits_non_zero_with_invariant_name() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[("dp_devices: 2", "dp_devices: 3")]);

    meridian()
        .arg("validate")
        .arg("--config")
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("UnevenShard"))
        .stderr(predicate::str::contains("dp_devices 3"));
}

#[test]
fn test_bad_schedule_exits_non_zero() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[("decay_steps: 20", "decay_steps: 30")]);

    meridian()
        .arg("validate")
        .arg("--config")
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("InvalidSchedule"));
}

#[test]
fn test_missing_manifest_is_invalid_config() {
    let temp = TempDir::new().unwrap();
    meridian()
        .arg("validate")
        .arg("--config")
        .arg(temp.path().join("missing.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("InvalidConfig"));
}

#[test]
fn test_bundled_demo_manifest_validates() {
    let demo = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../conf/pretrain.yaml");
    let shape = run_json(&["validate"], &demo);
    assert_eq!(shape["train_shards"], 4);
    assert_eq!(shape["world_size"], 8);
    assert_eq!(shape["per_replica_batch"], 4);
}
