//! CLI test cases.
//!
//! These only exercise commands which need no OCR provider or LLM. Each test
//! gets its own data directory via a generated config file.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("answer-eval").unwrap()
}

/// Create a data directory and a config file pointing at it.
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    fs::write(
        dir.path().join("config.toml"),
        format!("data_dir = '{}'\n", data_dir.display()),
    )
    .unwrap();
    dir
}

/// Run a subcommand against the config in `dir`.
fn cmd_in(dir: &Path) -> Command {
    let mut cmd = cmd();
    cmd.arg("--config").arg(dir.join("config.toml"));
    cmd
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
fn test_schema_job() {
    cmd()
        .args(["schema", "job"])
        .assert()
        .success()
        .stdout(predicate::str::contains("overall_score"))
        .stdout(predicate::str::contains("feedback_source"));
}

#[test]
fn test_schema_batch_input() {
    cmd()
        .args(["schema", "batch-input"])
        .assert()
        .success()
        .stdout(predicate::str::contains("subject_id"));
}

#[test]
fn test_status_unknown_job() {
    let dir = workspace();
    cmd_in(dir.path())
        .args(["status", "6f1c1b9e-3c2a-4c1e-9d7a-0b5e8f2a4c11"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No such job"));
}

#[test]
fn test_status_bad_job_id() {
    cmd().args(["status", "not-a-job"]).assert().failure();
}

#[test]
fn test_sweep_fails_orphans() {
    let dir = workspace();
    let jobs_dir = dir.path().join("data").join("jobs");
    fs::create_dir_all(&jobs_dir).unwrap();
    let id = "0d6a3c4e-8b7f-4f53-a1c2-5e9d8b7a6f10";
    fs::write(
        jobs_dir.join(format!("{id}.json")),
        format!(
            r#"{{
  "id": "{id}",
  "subject_id": "student-1",
  "question_id": "chem-1",
  "filename": "answer.png",
  "status": "processing",
  "stage": "extracting_text",
  "created_at": "2025-01-01T00:00:00Z",
  "updated_at": "2025-01-01T00:00:05Z"
}}"#
        ),
    )
    .unwrap();

    cmd_in(dir.path())
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""orphans_failed": 1"#));

    cmd_in(dir.path())
        .args(["status", id])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "failed""#))
        .stdout(predicate::str::contains("interrupted before completion"));

    // A second sweep has nothing left to do.
    cmd_in(dir.path())
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""orphans_failed": 0"#));
}

#[test]
fn test_sweep_spares_active_jobs() {
    let dir = workspace();
    let jobs_dir = dir.path().join("data").join("jobs");
    fs::create_dir_all(&jobs_dir).unwrap();
    let id = "3b9f2d71-5c4e-4a8b-9e6f-1d2c3b4a5f60";
    let now = chrono::Utc::now().to_rfc3339();
    fs::write(
        jobs_dir.join(format!("{id}.json")),
        format!(
            r#"{{
  "id": "{id}",
  "subject_id": "student-1",
  "question_id": "chem-1",
  "filename": "answer.png",
  "status": "processing",
  "stage": "analyzing_content",
  "created_at": "{now}",
  "updated_at": "{now}"
}}"#
        ),
    )
    .unwrap();

    cmd_in(dir.path())
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""orphans_failed": 0"#));
    cmd_in(dir.path())
        .args(["status", id])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "processing""#));

    // With no grace period, it's fair game.
    cmd_in(dir.path())
        .args(["sweep", "--orphan-after-minutes", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""orphans_failed": 1"#));
}

#[test]
fn test_evaluate_needs_question_bank() {
    let dir = workspace();
    let image = dir.path().join("answer.png");
    fs::write(&image, b"\x89PNG\r\n\x1a\n").unwrap();
    cmd_in(dir.path())
        .arg("evaluate")
        .arg(&image)
        .args(["--subject", "student-1", "--question", "chem-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No question bank configured"));
}
