//! Integration tests for `meridian schedule`.

mod common;

use common::{meridian, write_manifest};
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_schedule_json_rows() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    let output = meridian()
        .args(["schedule", "--every", "4", "--json", "--config"])
        .arg(&manifest)
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = rows.as_array().unwrap();

    let steps: Vec<u64> = rows.iter().map(|r| r["step"].as_u64().unwrap()).collect();
    assert_eq!(steps, [0, 4, 6, 8, 12, 16, 20, 24]);
    assert_eq!(rows[0]["learning_rate"], 0.0);
    assert!((rows[1]["learning_rate"].as_f64().unwrap() - 0.0006).abs() < 1e-15);
    assert_eq!(rows[2]["context_length"], 128);
    assert_eq!(rows[2]["stage"], "full");
    assert_eq!(rows[7]["learning_rate"], 0.00006);
}

#[test]
fn test_schedule_table_output() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    meridian()
        .args(["schedule", "--from", "3", "--to", "7", "--config"])
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Learning rate"))
        .stdout(predicate::str::contains("warmup"))
        .stdout(predicate::str::contains("full"));
}

#[test]
fn test_schedule_rejects_inverted_window() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp, &[]);

    meridian()
        .args(["schedule", "--from", "10", "--to", "2", "--config"])
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--from 10"));
}
