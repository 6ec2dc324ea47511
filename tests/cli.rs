//! CLI test cases.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("pairsmith").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_check_valid_config() {
    cmd()
        .arg("check")
        .arg("--config")
        .arg("tests/fixtures/config.toml")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("preference pairs"));
}

#[test]
fn test_check_rejects_template_directives() {
    cmd()
        .arg("check")
        .arg("--config")
        .arg("tests/fixtures/bad_template.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported construct"));
}

#[test]
fn test_check_missing_config_fails() {
    cmd()
        .arg("check")
        .arg("--config")
        .arg("tests/fixtures/does_not_exist.toml")
        .assert()
        .failure();
}

#[test]
fn test_run_refuses_missing_resume_session() {
    cmd()
        .arg("run")
        .arg("--config")
        .arg("tests/fixtures/config.toml")
        .arg("--output-dir")
        .arg(std::env::temp_dir().join("pairsmith-cli-test"))
        .arg("--resume")
        .arg("no-such-session")
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
