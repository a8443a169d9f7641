//! CLI integration tests

use std::process::{Command, Output};

fn cw(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cw"))
        .args(args)
        .env_remove("CW_API_URL")
        .output()
        .expect("Failed to execute command")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = cw(&["--help"]);
    let stdout = stdout(&output);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Chainwatch"), "Should show app name");
    assert!(stdout.contains("chains"), "Should show chains command");
    assert!(stdout.contains("models"), "Should show models command");
    assert!(stdout.contains("submit"), "Should show submit command");
    assert!(stdout.contains("feedback"), "Should show feedback command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = cw(&["--version"]);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout(&output).contains("cw"), "Should show binary name");
}

#[test]
fn test_chains_list_help() {
    let output = cw(&["chains", "list", "--help"]);
    let stdout = stdout(&output);

    assert!(output.status.success());
    assert!(stdout.contains("--actor"), "Should show actor option");
    assert!(stdout.contains("--asset"), "Should show asset option");
}

#[test]
fn test_chains_resolve_help() {
    let output = cw(&["chains", "resolve", "--help"]);
    let stdout = stdout(&output);

    assert!(output.status.success());
    assert!(stdout.contains("--false-positive"));
    assert!(stdout.contains("<ID>"), "Should show id argument");
}

#[test]
fn test_models_reload_help() {
    let output = cw(&["models", "reload", "--help"]);
    let stdout = stdout(&output);

    assert!(output.status.success());
    assert!(stdout.contains("--file"));
    assert!(stdout.contains("--checksum"));
}

#[test]
fn test_checksum_requires_file() {
    let output = cw(&["models", "reload", "threat-classifier", "--checksum", "abc"]);

    assert!(!output.status.success(), "Checksum without file should fail");
}

#[test]
fn test_feedback_requires_label() {
    let output = cw(&["feedback", "evt-1"]);

    assert!(!output.status.success(), "Missing argument should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

/// Test format option
#[test]
fn test_format_option() {
    let stdout = stdout(&cw(&["--help"]));

    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("table"), "Should show table format");
    assert!(stdout.contains("json"), "Should show json format");
}

#[test]
fn test_invalid_format_rejected() {
    let output = cw(&["--format", "yaml", "models", "list"]);

    assert!(!output.status.success());
}

/// Test api-url option
#[test]
fn test_api_url_option() {
    let stdout = stdout(&cw(&["--help"]));

    assert!(stdout.contains("--api-url"), "Should show api-url option");
    assert!(stdout.contains("CW_API_URL"), "Should show env var");
}

#[test]
fn test_submit_missing_file_fails() {
    let output = cw(&[
        "--api-url",
        "http://127.0.0.1:9",
        "submit",
        "/nonexistent/events.json",
    ]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read"));
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = cw(&["invalid-command"]);

    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}
