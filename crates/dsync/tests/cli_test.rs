//! Integration tests for the `dsync` binary.
//!
//! Every test points the config at a temp dir and serves the bundled
//! fixture topology through the in-memory bus.
#![allow(clippy::unwrap_used)]

use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/apartment.json")
}

/// Build a command isolated from the user's config and environment.
fn dsync_cmd(config_dir: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("dsync");
    cmd.env("DSYNC_CONFIG", config_dir.path().join("config.toml"))
        .env_remove("RUST_LOG")
        .env_remove("DSYNC_ENGINE__SCENE_WINDOW")
        .env_remove("DSYNC_BUS__TOPOLOGY");
    cmd
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn no_args_shows_help() {
    let dir = tempfile::tempdir().unwrap();
    let output = dsync_cmd(&dir).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage"));
}

#[test]
fn help_lists_the_commands() {
    let dir = tempfile::tempdir().unwrap();
    dsync_cmd(&dir).arg("--help").assert().success().stdout(
        predicate::str::contains("run")
            .and(predicate::str::contains("scan"))
            .and(predicate::str::contains("config")),
    );
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn config_path_honours_the_override() {
    let dir = tempfile::tempdir().unwrap();
    dsync_cmd(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn config_show_prints_defaults() {
    let dir = tempfile::tempdir().unwrap();
    dsync_cmd(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("[engine]")
                .and(predicate::str::contains("scene_window = \"2s\"")),
        );
}

#[test]
fn config_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    dsync_cmd(&dir).args(["config", "init"]).assert().success();
    assert!(dir.path().join("config.toml").exists());

    dsync_cmd(&dir)
        .args(["config", "init"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already exists"));
    dsync_cmd(&dir).args(["config", "init", "--force"]).assert().success();
}

#[test]
fn invalid_duration_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[engine]\nscene_window = \"whenever\"\n",
    )
    .unwrap();
    dsync_cmd(&dir)
        .args(["config", "show"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("engine.scene_window"));
}

// ── Scan ────────────────────────────────────────────────────────────

#[test]
fn scan_prints_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let output = dsync_cmd(&dir)
        .args(["scan", "--timeout", "10s", "--topology"])
        .arg(fixture())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["devices"].as_array().unwrap().len(), 3);
    assert_eq!(summary["nodes"][0]["valid"], true);

    // Both south-facing class-2 blinds share one automatic cluster.
    let clusters = summary["clusters"].as_array().unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0]["members"].as_array().unwrap().len(), 2);
}

#[test]
fn scan_without_topology_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    dsync_cmd(&dir)
        .arg("scan")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No bus topology"));
}

#[test]
fn unreadable_topology_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    dsync_cmd(&dir)
        .args(["scan", "--topology"])
        .arg(dir.path().join("missing.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not read bus topology"));
}

// ── Run ─────────────────────────────────────────────────────────────

#[test]
fn run_streams_events_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let output = dsync_cmd(&dir)
        .args(["run", "--duration", "2s", "--topology"])
        .arg(fixture())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let kinds: Vec<String> = stdout
        .lines()
        .map(|line| {
            let event: serde_json::Value = serde_json::from_str(line).unwrap();
            event["event"].as_str().unwrap().to_owned()
        })
        .collect();
    assert!(kinds.iter().any(|k| k == "device_ready"));
    assert!(kinds.iter().any(|k| k == "model_ready"));
}
