//! Integration tests for the vpnforge CLI surface.
//!
//! Filesystem-touching tests point `HOME` at a temp directory so they never
//! read or write the real `~/.vpnforge`.

#![allow(clippy::expect_used, deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn vpnforge() -> Command {
    Command::cargo_bin("vpnforge").expect("vpnforge binary should exist")
}

/// A temp HOME with a pre-seeded setup document.
fn seeded_home(contents: &str) -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    let state_dir = dir.path().join(".vpnforge");
    std::fs::create_dir_all(&state_dir).expect("state dir");
    std::fs::write(state_dir.join("setup.json"), contents).expect("seed document");
    dir
}

// --- Help and version ---

#[test]
fn test_cli_no_args_shows_help_and_exits_two() {
    // clap with arg_required_else_help shows help on stderr and exits 2
    vpnforge()
        .assert()
        .code(2)
        .stderr(predicate::str::contains("WireGuard"));
}

#[test]
fn test_cli_help_flag_shows_commands() {
    vpnforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("review"));
}

#[test]
fn test_version_command_shows_version() {
    vpnforge()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vpnforge 0.3.0"));
}

#[test]
fn test_version_command_json_outputs_valid_json() {
    vpnforge()
        .args(["version", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"version":"0.3.0"}"#));
}

// --- Argument validation ---

#[test]
fn test_run_continue_conflicts_with_phase() {
    vpnforge()
        .args(["run", "--continue", "--phase", "2"])
        .assert()
        .code(2);
}

#[test]
fn test_run_unknown_phase_exits_not_found() {
    let home = TempDir::new().expect("temp dir");
    vpnforge()
        .env("HOME", home.path())
        .args(["run", "--phase", "9", "--yes"])
        .assert()
        .code(5)
        .stderr(predicate::str::contains("no phase with id 9"));
}

// --- Review ---

#[test]
fn test_review_without_document_exits_config_error() {
    let home = TempDir::new().expect("temp dir");
    vpnforge()
        .env("HOME", home.path())
        .arg("review")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("no setup document"));
}

#[test]
fn test_review_shows_phase_statuses() {
    let home = seeded_home(r#"{"version":2}"#);
    vpnforge()
        .env("HOME", home.path())
        .arg("review")
        .assert()
        .success()
        .stdout(predicate::str::contains("system-prep"))
        .stdout(predicate::str::contains("pending"));
}

#[test]
fn test_review_json_dumps_document() {
    let home = seeded_home(r#"{"version":2}"#);
    vpnforge()
        .env("HOME", home.path())
        .args(["review", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""version": 2"#))
        .stdout(predicate::str::contains("10.66.66.0/24"));
}

#[test]
fn test_review_corrupt_document_fails_closed() {
    let home = seeded_home("{not json");
    vpnforge()
        .env("HOME", home.path())
        .arg("review")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("corrupt"));
}

#[test]
fn test_review_newer_schema_fails_closed() {
    let home = seeded_home(r#"{"version":99}"#);
    vpnforge()
        .env("HOME", home.path())
        .arg("review")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("schema version 99"));
}

#[test]
fn test_json_error_object_on_failure() {
    let home = TempDir::new().expect("temp dir");
    vpnforge()
        .env("HOME", home.path())
        .args(["review", "--json"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains(r#""error": true"#))
        .stderr(predicate::str::contains(r#""code": "config""#));
}
