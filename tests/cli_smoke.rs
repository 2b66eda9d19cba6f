//! CLI smoke tests for the slipway binary.

#![cfg(unix)]

use std::fs;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

fn slipway() -> Command {
    Command::cargo_bin("slipway").unwrap()
}

#[test]
fn test_build_creates_output_and_caches() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("build.toml"),
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["out"]

        [commands.c1]
        tool = "shell"
        outputs = ["out"]
        args = "echo hi > out"
        "#,
    )
    .unwrap();

    slipway()
        .args(["build", "all", "--db", "build.db"])
        .current_dir(tmp.path())
        .assert()
        .success();
    assert_eq!(fs::read_to_string(tmp.path().join("out")).unwrap(), "hi\n");
    assert!(tmp.path().join("build.db").exists());

    // A second invocation reuses the database.
    slipway()
        .args(["build", "all", "--db", "build.db"])
        .current_dir(tmp.path())
        .assert()
        .success();
}

#[test]
fn test_missing_manifest_fails() {
    let tmp = TempDir::new().unwrap();

    slipway()
        .args(["build", "all"])
        .current_dir(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unable to load build file"));
}

#[test]
fn test_trace_file_is_written() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("build.toml"),
        r#"
        [client]
        name = "basic"

        [targets]
        all = ["<nothing>"]
        "#,
    )
    .unwrap();

    slipway()
        .args(["build", "all", "--trace", "build.trace"])
        .current_dir(tmp.path())
        .assert()
        .success();

    let trace = fs::read_to_string(tmp.path().join("build.trace")).unwrap();
    assert!(trace.contains("\"event\":\"build-started\""));
    assert!(trace.lines().count() >= 2);
}
