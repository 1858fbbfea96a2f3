//! Integration tests for the flipflop CLI.

use assert_cmd::Command;
use std::fs;
use tempfile::TempDir;

/// Helper to run the flipflop CLI with given arguments.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("flipflop").expect("failed to find flipflop binary");
    cmd.args(args);
    cmd
}

#[test]
fn test_init_then_validate() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.yaml");
    let config_str = config_path.to_str().unwrap();

    run_cli(&["init", config_str]).assert().success();
    assert!(config_path.exists());

    run_cli(&["validate", config_str])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration is valid"));
}

#[test]
fn test_validate_rejects_malformed_config() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "data:\n  inputs: []\n").unwrap();

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_validate_missing_file_fails() {
    run_cli(&["validate", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_train_refuses_existing_output_dir() {
    let dir = TempDir::new().unwrap();
    let output_dir = dir.path().join("training");
    fs::create_dir(&output_dir).unwrap();

    let config_path = dir.path().join("config.yaml");
    fs::write(
        &config_path,
        format!(
            "data:\n  inputs:\n    - ./reads.jsonl\noutput_dir: {}\n",
            output_dir.display()
        ),
    )
    .unwrap();

    run_cli(&["train", config_path.to_str().unwrap()])
        .assert()
        .code(1)
        .stderr(predicates::str::contains("exists"));
}

#[test]
fn test_train_missing_reads_fails() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.yaml");
    let output_dir = dir.path().join("out");
    fs::write(
        &config_path,
        format!(
            "data:\n  inputs:\n    - {}/missing.jsonl\noutput_dir: {}\n",
            dir.path().display(),
            output_dir.display()
        ),
    )
    .unwrap();

    run_cli(&["train", config_path.to_str().unwrap()])
        .assert()
        .failure();
}
