//! Integration tests for the `twinline` CLI binary.
//!
//! These run the real binary against temporary input files with the
//! environment isolated from the user's configuration.
#![allow(clippy::unwrap_used)]

use std::io::Write;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::NamedTempFile;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `twinline` binary with env isolation.
fn twinline_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("twinline");
    cmd.env("HOME", "/tmp/twinline-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/twinline-cli-test-nonexistent")
        .env_remove("TWINLINE_CONFIG")
        .env_remove("TWINLINE_OUTPUT")
        .env_remove("TWINLINE_GATEWAY__ADMIN_SERVICE")
        .env_remove("RUST_LOG");
    cmd
}

fn input(lines: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    file
}

const P1: &str = r#"{"provider":"p1","service":"s1","resource":"r1","value":5}"#;
const P1_LATER: &str =
    r#"{"provider":"p1","service":"s1","resource":"r1","value":"7","timestamp":"2030-01-01T00:00:00Z"}"#;

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = twinline_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_lists_commands() {
    twinline_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("replay").and(predicate::str::contains("config")),
    );
}

// ── Replay ──────────────────────────────────────────────────────────

#[test]
fn test_replay_prints_twin_as_json() {
    let file = input(&[P1]);
    twinline_cmd()
        .args(["replay", "--output", "json"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#""name": "p1""#)
                .and(predicate::str::contains(r#""kind": "integer""#))
                .and(predicate::str::contains(r#""value": 5"#)),
        )
        .stderr(predicate::str::contains("1 applied"));
}

#[test]
fn test_replay_reads_stdin() {
    twinline_cmd()
        .args(["replay", "-", "--output", "plain", "--quiet"])
        .write_stdin(format!("{P1}\n{P1_LATER}\n"))
        .assert()
        .success()
        .stdout("p1\n");
}

#[test]
fn test_replay_coerces_to_declared_kind() {
    let file = input(&[P1, P1_LATER]);
    twinline_cmd()
        .args(["replay", "-o", "json-compact", "-q"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""name":"r1","resource_type":"SENSOR""#)
            .and(predicate::str::contains(r#""value":7"#)));
}

#[test]
fn test_replay_skips_malformed_lines() {
    let file = input(&[P1, "{not json", r#"{"provider":"","service":"s","resource":"r","value":1}"#]);
    twinline_cmd()
        .args(["replay", "--output", "plain"])
        .arg(file.path())
        .assert()
        .success()
        .stdout("p1\n")
        .stderr(
            predicate::str::contains("line 2: malformed update")
                .and(predicate::str::contains("line 3:"))
                .and(predicate::str::contains("2 skipped")),
        );
}

#[test]
fn test_replay_reports_failed_commands() {
    let file = input(&[P1, r#"{"provider":"p1","service":"s1","resource":"r1","value":"lots"}"#]);
    twinline_cmd()
        .args(["replay", "--output", "plain"])
        .arg(file.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("line 2:").and(predicate::str::contains("1 failed")));
}

#[test]
fn test_replay_prints_notification_batches() {
    let file = input(&[P1]);
    twinline_cmd()
        .args(["replay", "--notifications", "--output", "plain"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#""command_id":"#)
                .and(predicate::str::contains(r#""status":"PROVIDER_CREATED""#))
                .and(predicate::str::contains(r#""type":"resource_data""#)),
        );
}

#[test]
fn test_replay_filters_by_model() {
    let file = input(&[
        P1,
        r#"{"model":"lamp","provider":"l1","service":"light","resource":"on","value":true}"#,
    ]);
    twinline_cmd()
        .args(["replay", "--model", "lamp", "--output", "plain", "-q"])
        .arg(file.path())
        .assert()
        .success()
        .stdout("l1\n");
}

#[test]
fn test_replay_batch_mode() {
    let file = input(&[P1, r#"{"provider":"p2","service":"s","resource":"r","value":1}"#]);
    twinline_cmd()
        .args(["replay", "--batch", "--output", "plain"])
        .arg(file.path())
        .assert()
        .success()
        .stdout("p1\np2\n")
        .stderr(predicate::str::contains("2 applied"));
}

#[test]
fn test_replay_missing_input_fails() {
    twinline_cmd()
        .args(["replay", "/tmp/twinline-cli-test-nonexistent/in.jsonl"])
        .assert()
        .failure()
        .code(1);
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_show_defaults() {
    twinline_cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("[gateway]")
                .and(predicate::str::contains("admin_service = true"))
                .and(predicate::str::contains("[logging]")),
        );
}

#[test]
fn test_config_show_env_override() {
    twinline_cmd()
        .env("TWINLINE_GATEWAY__ADMIN_SERVICE", "false")
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("admin_service = false"));
}

#[test]
fn test_config_file_disables_admin_service() {
    let mut cfg = NamedTempFile::new().unwrap();
    writeln!(cfg, "[gateway]\nadmin_service = false").unwrap();
    let file = input(&[P1]);

    twinline_cmd()
        .arg("--config")
        .arg(cfg.path())
        .args(["replay", "--output", "json-compact", "-q"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("admin").not());
}

#[test]
fn test_config_path_uses_flag() {
    twinline_cmd()
        .args(["config", "path", "--config", "/etc/twinline/custom.toml"])
        .assert()
        .success()
        .stdout("/etc/twinline/custom.toml\n");
}

#[test]
fn test_missing_explicit_config_is_reported() {
    twinline_cmd()
        .args(["config", "show", "--config", "/tmp/twinline-cli-test-nonexistent/c.toml"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("Configuration file not found"));
}

#[test]
fn test_invalid_config_value_is_usage_error() {
    let mut cfg = NamedTempFile::new().unwrap();
    writeln!(cfg, "[gateway]\nnotification_capacity = 0").unwrap();
    twinline_cmd()
        .arg("--config")
        .arg(cfg.path())
        .args(["config", "show"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("notification_capacity"));
}
