//! CLI smoke tests.
//!
//! These verify argument parsing, privilege/prerequisite refusal, and the
//! user-error exit code without touching any real disk. The lock path is
//! redirected into a temp directory so the suite never contends with a
//! real build on the host.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn darch(tmp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("darch").unwrap();
    cmd.env("DARCH_LOCK_FILE", tmp.path().join("darch.lock"));
    cmd
}

#[test]
fn help_lists_commands() {
    let tmp = TempDir::new().unwrap();
    darch(&tmp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("apply"))
        .stdout(predicate::str::contains("rollback"))
        .stdout(predicate::str::contains("gc"));
}

#[test]
fn version_runs() {
    let tmp = TempDir::new().unwrap();
    darch(&tmp).arg("--version").assert().success();
}

#[test]
fn test_with_missing_image_is_a_user_error() {
    let tmp = TempDir::new().unwrap();
    darch(&tmp)
        .args(["test", "/definitely/not/here.img"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn apply_with_missing_config_is_a_user_error() {
    let tmp = TempDir::new().unwrap();
    let image = tmp.path().join("disk.img");
    let config = tmp.path().join("nonexistent.lua");

    // Fails as non-root, on missing tools, or on the missing config -
    // all user errors, and no image file may appear as a side effect.
    darch(&tmp)
        .args(["apply", "--image"])
        .arg(&image)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .code(1);
    assert!(!image.exists());
}

#[test]
fn rollback_without_image_flag_is_a_usage_error() {
    let tmp = TempDir::new().unwrap();
    darch(&tmp)
        .arg("rollback")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--image"));
}

#[test]
fn gc_on_missing_image_is_a_user_error() {
    let tmp = TempDir::new().unwrap();
    darch(&tmp)
        .args(["gc", "--image", "/definitely/not/here.img"])
        .assert()
        .failure()
        .code(1);
}
