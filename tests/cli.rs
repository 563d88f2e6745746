//! Command-line tests for the geoallow binary.
//!
//! Commands that touch the host firewall require root and are marked
//! with #[ignore]. Run with: `sudo cargo test --release -- --ignored`

use std::fs;
use std::process::Command;
use tempfile::TempDir;

/// Check if running as root
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Run geoallow and return its output
fn run_geoallow(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_geoallow"))
        .args(args)
        .output()
        .expect("Failed to execute geoallow")
}

#[test]
fn test_version_flag() {
    let output = run_geoallow(&["--version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("geoallow"));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_help_lists_commands() {
    let output = run_geoallow(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["add", "remove", "update", "status", "snapshot", "restore"] {
        assert!(stdout.contains(command), "help is missing '{}'", command);
    }
}

#[test]
fn test_invalid_country_code_exits_1() {
    let output = run_geoallow(&["add", "U5", "--dry-run"]);
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stdout.contains("Invalid country code") || stderr.contains("Invalid country code"),
        "stdout: {}\nstderr: {}",
        stdout,
        stderr
    );
}

#[test]
fn test_add_without_countries_is_usage_error() {
    let output = run_geoallow(&["add"]);
    assert!(!output.status.success());
}

#[test]
fn test_invalid_config_exits_1() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.yaml");
    fs::write(&config, "registry_url: \"http://insecure.example/{country}\"\n").unwrap();

    let output = run_geoallow(&["-c", config.to_str().unwrap(), "update", "--dry-run"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_missing_custom_config_exits_1() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("absent.yaml");

    let output = run_geoallow(&["-c", config.to_str().unwrap(), "update", "--dry-run"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
#[ignore] // Requires root
fn test_status_command() {
    if !is_root() {
        eprintln!("Skipping test_status_command: requires root");
        return;
    }

    let output = run_geoallow(&["status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Countries:"));
    assert!(stdout.contains("Policy:"));
}
