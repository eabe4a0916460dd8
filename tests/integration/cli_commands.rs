//! Binary-level tests that never touch the network
//!
//! The configurations here have no targets and probing disabled, so runs only
//! exercise the store and the lock lifecycle.

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_config(dir: &Path, body: serde_json::Value) -> PathBuf {
    let path = dir.join("publisher.json");
    fs::write(&path, serde_json::to_string_pretty(&body).unwrap()).unwrap();
    path
}

fn offline_config(dir: &Path) -> PathBuf {
    write_config(
        dir,
        serde_json::json!({
            "providers": [],
            "targets": [],
            "probe": {"enabled": false},
            "lock": {"store_dir": dir.join("state")},
        }),
    )
}

fn write_products(dir: &Path, lines: &[&str]) -> PathBuf {
    let path = dir.join("products.jsonl");
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn cmd() -> Command {
    Command::cargo_bin("product-video-publisher").unwrap()
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_validate_accepts_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        serde_json::json!({
            "providers": [{
                "name": "primary",
                "submit_url": "https://gen.example/jobs",
                "status_url": "https://gen.example/jobs/{job_id}",
                "timeout_secs": 300
            }],
            "targets": [{"name": "tiktok", "endpoint": "https://hooks.example/tiktok"}],
        }),
    );

    let output = cmd()
        .args(["--output-format", "json", "validate", "--config"])
        .arg(&config)
        .output()
        .unwrap();

    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["valid"], true);
    assert_eq!(report["providers"], serde_json::json!(["primary"]));
    assert_eq!(report["targets"], serde_json::json!(["tiktok"]));
}

#[test]
fn test_validate_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        serde_json::json!({
            "targets": [
                {"name": "tiktok", "endpoint": "not a url"},
                {"name": "tiktok", "endpoint": "https://hooks.example/b"}
            ],
            "publish": {"max_parallel": 0},
        }),
    );

    let output = cmd().args(["validate", "--config"]).arg(&config).output().unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("duplicate target name 'tiktok'"), "{stderr}");
    assert!(stderr.contains("max_parallel"), "{stderr}");
}

#[test]
fn test_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    cmd()
        .args(["validate", "--config"])
        .arg(dir.path().join("absent.json"))
        .assert()
        .failure();
}

#[test]
fn test_run_then_skip_then_forget() {
    let dir = TempDir::new().unwrap();
    let config = offline_config(dir.path());
    let products = write_products(
        dir.path(),
        &[
            r#"{"fingerprint": "SKU-1", "existing_media_url": "https://cdn.example/1.mp4"}"#,
            r#"{"fingerprint": "SKU-1", "existing_media_url": "https://cdn.example/1.mp4"}"#,
        ],
    );

    let first = cmd()
        .args(["--output-format", "json", "run", "--config"])
        .arg(&config)
        .arg("--products")
        .arg(&products)
        .output()
        .unwrap();
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    let summary = stdout_json(&first);
    assert_eq!(summary["processed"], 1);
    assert_eq!(summary["duplicates"], 1);
    assert_eq!(summary["outcomes"]["no_platforms_configured"], 1);
    assert_eq!(summary["runs"][0]["path"], "existing");

    let second = cmd()
        .args(["--output-format", "json", "run", "--config"])
        .arg(&config)
        .arg("--products")
        .arg(&products)
        .output()
        .unwrap();
    assert!(second.status.success());
    let summary = stdout_json(&second);
    assert_eq!(summary["skipped"], 1);
    assert_eq!(summary["runs"][0]["disposition"], "skipped_completed");

    let status = cmd()
        .args(["--output-format", "json", "status", "--config"])
        .arg(&config)
        .args(["--fingerprint", "SKU-1"])
        .output()
        .unwrap();
    assert!(status.status.success());
    let records = stdout_json(&status);
    assert_eq!(records[0]["outcome"], "no_platforms_configured");
    assert_eq!(records[0]["media_url"], "https://cdn.example/1.mp4");

    cmd()
        .args(["release", "--config"])
        .arg(&config)
        .args(["--fingerprint", "SKU-1", "--forget"])
        .assert()
        .success();

    cmd()
        .args(["status", "--config"])
        .arg(&config)
        .args(["--fingerprint", "SKU-1"])
        .assert()
        .failure();
}

#[test]
fn test_generation_failure_sets_exit_code() {
    let dir = TempDir::new().unwrap();
    let config = offline_config(dir.path());
    let products = write_products(dir.path(), &[r#"{"fingerprint": "SKU-2"}"#]);

    let output = cmd()
        .args(["run", "--config"])
        .arg(&config)
        .arg("--products")
        .arg(&products)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("generation_failed"), "{stdout}");
}

#[test]
fn test_writeback_csv_written() {
    let dir = TempDir::new().unwrap();
    let config = offline_config(dir.path());
    let products = write_products(
        dir.path(),
        &[r#"{"fingerprint": "SKU-3", "existing_media_url": "https://cdn.example/3.mp4"}"#],
    );
    let csv_path = dir.path().join("outcomes.csv");

    cmd()
        .args(["run", "--config"])
        .arg(&config)
        .arg("--products")
        .arg(&products)
        .arg("--writeback")
        .arg(&csv_path)
        .assert()
        .success();

    let csv = fs::read_to_string(&csv_path).unwrap();
    assert!(csv.contains("SKU-3"));
    assert!(csv.contains("no_platforms_configured"));
}

#[test]
fn test_release_unlocked_record_is_noop() {
    let dir = TempDir::new().unwrap();
    let config = offline_config(dir.path());
    let products = write_products(
        dir.path(),
        &[r#"{"fingerprint": "SKU-4", "existing_media_url": "https://cdn.example/4.mp4"}"#],
    );
    cmd()
        .args(["run", "--config"])
        .arg(&config)
        .arg("--products")
        .arg(&products)
        .assert()
        .success();

    let output = cmd()
        .args(["release", "--config"])
        .arg(&config)
        .args(["--fingerprint", "SKU-4"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("not locked"));
}
