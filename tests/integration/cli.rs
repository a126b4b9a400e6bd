//! The `dso-l2` binary's configuration handling.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn dso() -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dso-l2");
    for key in [
        "DSO_CONFIG",
        "DSO_LISTEN_ADDR",
        "DSO_MAX_CONNECTIONS",
        "DSO_APPLY_WORKERS",
        "DSO_LOCK_STATS",
        "DSO_LOG",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("dso-l2.toml");
    fs::write(&path, contents).expect("write config");
    path
}

#[test]
fn check_config_accepts_a_valid_file() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "[pipeline]\napply_workers = 2\n");
    dso()
        .arg("--config")
        .arg(&path)
        .arg("--check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration ok"));
}

#[test]
fn print_config_shows_overrides() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "[server]\nmax_connections = 9\n");
    dso()
        .arg("--config")
        .arg(&path)
        .args(["--listen", "127.0.0.1:7777", "--print-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("listen_addr = \"127.0.0.1:7777\""))
        .stdout(predicate::str::contains("max_connections = 9"));
}

#[test]
fn environment_overrides_the_file() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "[pipeline]\napply_workers = 2\n");
    dso()
        .arg("--config")
        .arg(&path)
        .arg("--print-config")
        .env("DSO_APPLY_WORKERS", "6")
        .assert()
        .success()
        .stdout(predicate::str::contains("apply_workers = 6"));
}

#[test]
fn invalid_config_exits_with_code_two() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "[limits]\nkeepalive_ms = 50000\ndead_ms = 100\n");
    dso()
        .arg("--config")
        .arg(&path)
        .arg("--check-config")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn unreadable_config_is_reported() {
    let dir = TempDir::new().expect("tempdir");
    dso()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("--check-config")
        .assert()
        .code(2);
}
