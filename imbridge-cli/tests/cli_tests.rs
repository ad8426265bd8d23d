//! Runs the `imbridge` binary end to end

use std::process::Command;
use tempfile::TempDir;

fn imbridge() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_imbridge"));
    command.env_remove("RUST_LOG");
    command
}

#[test]
fn test_check_config_accepts_valid_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("imbridge.toml");
    std::fs::write(
        &path,
        "[account]\nphone = \"+15550123\"\n\n[session]\nmax_reconnect_attempts = 5\n",
    )
    .unwrap();

    let output = imbridge()
        .args(["--config", path.to_str().unwrap(), "check-config"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"max_reconnect_attempts\": 5"));
}

#[test]
fn test_check_config_rejects_bad_phone() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("imbridge.toml");
    std::fs::write(&path, "[account]\nphone = \"call-me\"\n").unwrap();

    let output = imbridge()
        .args(["--config", path.to_str().unwrap(), "check-config"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_show_state_with_corrupt_file_reports_fresh_session() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("imbridge.toml");
    std::fs::write(&config, "").unwrap();
    let state = dir.path().join("state.json");
    std::fs::write(&state, "{not json").unwrap();

    let output = imbridge()
        .args([
            "--config",
            config.to_str().unwrap(),
            "show-state",
            "--path",
            state.to_str().unwrap(),
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("fresh session"));
}

#[test]
fn test_demo_runs() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("imbridge.toml");
    std::fs::write(&config, "").unwrap();

    let output = imbridge()
        .args(["--config", config.to_str().unwrap(), "--log-level", "warn", "demo", "ping"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Hi there!"));
}
