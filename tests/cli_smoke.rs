//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn missing_required_flag_is_an_error() {
    let mut cmd = cargo_bin_cmd!("batchsub");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--configuration-file"));
}

#[test]
fn unreadable_configuration_file_fails_before_any_remote_work() {
    let mut cmd = cargo_bin_cmd!("batchsub");
    cmd.args(["-c", "/definitely/not/here.config"]);
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn unrecognized_keys_are_reported_together() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("job.config");
    std::fs::write(&path, "FIRST:=1\nSECOND:=2\n").expect("write config");

    let mut cmd = cargo_bin_cmd!("batchsub");
    cmd.arg("-c").arg(&path);
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("FIRST").and(predicate::str::contains("SECOND")));
}
