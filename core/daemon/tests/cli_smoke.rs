use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn daemon_bin() -> &'static str {
    env!("CARGO_BIN_EXE_hpcaas-daemon")
}

fn write_config(root: &Path) -> PathBuf {
    let config_path = root.join("agent.toml");
    let config = format!(
        "code_root = \"{}\"\ndaemon_dir = \"{}\"\ndefault_code_name = \"smoke-code\"\nreconcile_interval_ms = 50\n",
        root.join("code").display(),
        root.join("daemon").display()
    );
    fs::write(&config_path, config).expect("write config");
    config_path
}

fn run_cli(config_path: &Path, args: &[&str]) -> Output {
    Command::new(daemon_bin())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("HPCAAS_AGENT_CONFIG")
        .output()
        .expect("run hpcaas-daemon")
}

#[test]
fn config_subcommand_prints_resolved_values() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config_path = write_config(temp_dir.path());

    let output = run_cli(&config_path, &["config"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("default_code_name = \"smoke-code\""), "{}", stdout);
    assert!(stdout.contains("reconcile_interval_ms = 50"), "{}", stdout);
    assert!(stdout.contains("adopted_poll_interval_ms = 1000"), "{}", stdout);
}

#[test]
fn state_subcommand_fails_without_snapshot() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config_path = write_config(temp_dir.path());

    let output = run_cli(&config_path, &["state"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn run_persists_state_readable_by_state_subcommand() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config_path = write_config(temp_dir.path());
    let snapshot = temp_dir.path().join("daemon").join("state.json");

    let mut daemon = Command::new(daemon_bin())
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .env("AUTHORIZATION", "smoke-key")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn daemon");

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut persisted = false;
    while Instant::now() < deadline {
        if fs::read_to_string(&snapshot)
            .map(|content| content.contains("smoke-key"))
            .unwrap_or(false)
        {
            persisted = true;
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    let _ = daemon.kill();
    let _ = daemon.wait();
    assert!(persisted, "snapshot never recorded the authorization key");
    assert!(temp_dir.path().join("daemon").join("daemon_has_started").exists());

    let output = run_cli(&config_path, &["state"]);
    assert!(output.status.success());
    let state: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("state is JSON");
    assert_eq!(state["codeName"], "smoke-code");
    assert_eq!(state["codeStatus"], "waiting");
    assert_eq!(state["authorizationKey"], "smoke-key");
}
