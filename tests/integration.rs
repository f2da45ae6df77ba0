//! Integration tests for the `hardpin` binary.
//!
//! These compile and invoke the binary end-to-end for the commands that do
//! not need a container engine: baseline inspection, argument validation,
//! and help output. Registry-touching commands are exercised at the library
//! level with a fake digest source instead.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn hardpin_bin() -> PathBuf {
    // Set by cargo for integration tests of [[bin]] targets.
    PathBuf::from(env!("CARGO_BIN_EXE_hardpin"))
}

const BASELINE_JSON: &str = r#"{
  "repository": "upstream/app",
  "tag": "2.0",
  "manifest_list": "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc",
  "digests": {
    "amd64": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
    "arm64": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
  },
  "updated_at": "2026-08-30T00:00:00Z"
}"#;

#[test]
fn test_help_lists_subcommands() {
    let out = Command::new(hardpin_bin())
        .arg("--help")
        .output()
        .expect("running hardpin --help");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("baseline"));
    assert!(stdout.contains("pipeline"));
    assert!(stdout.contains("doctor"));
}

#[test]
fn test_baseline_show_prints_record() {
    let dir = TempDir::new().unwrap();
    let baseline = dir.path().join("baseline.json");
    fs::write(&baseline, BASELINE_JSON).unwrap();

    let out = Command::new(hardpin_bin())
        .args(["baseline", "show", "--baseline"])
        .arg(&baseline)
        .output()
        .expect("running hardpin baseline show");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("upstream/app"));
    assert!(stdout.contains("sha256:aaaa"));
    assert!(stdout.contains("arm64"));
}

#[test]
fn test_baseline_show_without_record_reports_absence() {
    let dir = TempDir::new().unwrap();
    let out = Command::new(hardpin_bin())
        .args(["baseline", "show", "--baseline"])
        .arg(dir.path().join("nope.json"))
        .output()
        .expect("running hardpin baseline show");
    // Absence is informational for a read-only inspection, not a failure.
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("No baseline recorded"), "stdout: {stdout}");
}

#[test]
fn test_baseline_show_rejects_corrupt_record() {
    let dir = TempDir::new().unwrap();
    let baseline = dir.path().join("baseline.json");
    fs::write(&baseline, "{ definitely not json").unwrap();

    let out = Command::new(hardpin_bin())
        .args(["baseline", "show", "--baseline"])
        .arg(&baseline)
        .output()
        .expect("running hardpin baseline show");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("malformed"), "stderr: {stderr}");
}

#[test]
fn test_unknown_subcommand_fails() {
    let out = Command::new(hardpin_bin())
        .arg("frobnicate")
        .output()
        .expect("running hardpin frobnicate");
    assert!(!out.status.success());
}
