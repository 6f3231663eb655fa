#![cfg(feature = "cli")]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

type TestResult<T = ()> = Result<T, Box<dyn Error>>;

fn steward() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_steward"));
    command.env_remove("STEWARD_CONFIG").env("STEWARD_LOG", "warn");
    command
}

fn agent_config(dir: &Path) -> TestResult<PathBuf> {
    let path = dir.join("agent.toml");
    fs::write(
        &path,
        r#"
host = "host1"
vm_config_dir = "vms"
run_dir = "run"

[consul]
address = "http://127.0.0.1:1"
"#,
    )?;
    Ok(path)
}

fn run(args: &[&str]) -> TestResult<Output> {
    Ok(steward().args(args).output()?)
}

#[test]
fn version_flag_succeeds() -> TestResult {
    let output = run(&["--version"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.starts_with("steward "), "{stdout}");
    Ok(())
}

#[test]
fn unknown_subcommand_is_a_usage_error() -> TestResult {
    let output = run(&["frobnicate"])?;
    assert_eq!(output.status.code(), Some(64));
    Ok(())
}

#[test]
fn missing_subcommand_prints_help() -> TestResult {
    let output = run(&[])?;
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8(output.stdout)?.contains("Usage"));
    Ok(())
}

#[test]
fn unknown_vm_is_unavailable() -> TestResult {
    let dir = TempDir::new()?;
    let config = agent_config(dir.path())?;
    let config = config.to_str().ok_or("non-utf8 path")?;

    for command in ["status", "ensure", "start", "stop"] {
        let output = run(&["--config", config, command, "ghost"])?;
        assert_eq!(output.status.code(), Some(69), "{command}");
        let stderr = String::from_utf8(output.stderr)?;
        assert!(stderr.contains("No configuration for VM `ghost`"), "{stderr}");
    }
    Ok(())
}

#[test]
fn explicit_missing_config_is_an_io_error() -> TestResult {
    let dir = TempDir::new()?;
    let missing = dir.path().join("absent.toml");
    let output = run(&["--config", missing.to_str().ok_or("non-utf8 path")?, "status", "web"])?;
    assert_eq!(output.status.code(), Some(74));
    Ok(())
}

#[test]
fn malformed_event_batch_is_rejected() -> TestResult {
    use std::io::Write;
    use std::process::Stdio;

    let dir = TempDir::new()?;
    let config = agent_config(dir.path())?;
    let mut child = steward()
        .args(["--config", config.to_str().ok_or("non-utf8 path")?, "handle-event"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    child
        .stdin
        .take()
        .ok_or("stdin not captured")?
        .write_all(b"{not json")?;
    assert_eq!(child.wait()?.code(), Some(65));
    Ok(())
}

#[test]
fn empty_event_batch_is_a_no_op() -> TestResult {
    use std::process::Stdio;

    let dir = TempDir::new()?;
    let config = agent_config(dir.path())?;
    let status = steward()
        .args(["--config", config.to_str().ok_or("non-utf8 path")?, "handle-event"])
        .stdin(Stdio::null())
        .status()?;
    assert!(status.success());
    Ok(())
}
