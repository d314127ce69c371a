//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! They test the "wiring" between the CLI and the core library; nothing
//! here starts networking.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("quire").expect("Failed to find quire binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Extract the value of an indented `<label>: <value>` line
fn extract_field(output: &str, label: &str) -> Option<String> {
    let prefix = format!("  {}: ", label);
    output
        .lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .map(|v| v.trim().to_string())
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "command failed: {:?}", output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Create a group and return its discovery key
fn create_group(data_dir: &TempDir, title: &str) -> String {
    let out = stdout_of(cli_cmd(data_dir).args(["group", "create", title]));
    extract_field(&out, "ID").expect("group id in output")
}

// ============================================================================
// Info Command Tests
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Quire"))
        .stdout(predicate::str::contains("Data directory:"))
        .stdout(predicate::str::contains("Groups: 0"))
        .stdout(predicate::str::contains("networking never started"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let data_dir = TempDir::new().unwrap();
    let config = data_dir.path().join("swarm.json");
    std::fs::write(&config, r#"{"max_peers_per_group": 0}"#).unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .arg("info")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_peers_per_group"));
}

// ============================================================================
// Group Command Tests
// ============================================================================

#[test]
fn test_group_create() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["group", "create", "Field notes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created group: Field notes"))
        .stdout(predicate::str::contains("ID:"));
}

#[test]
fn test_group_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["group", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No groups found"));
}

#[test]
fn test_group_list_with_groups() {
    let data_dir = TempDir::new().unwrap();
    create_group(&data_dir, "First");
    create_group(&data_dir, "Second");

    cli_cmd(&data_dir)
        .args(["group", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Groups (2)"))
        .stdout(predicate::str::contains("First"))
        .stdout(predicate::str::contains("Second"));
}

#[test]
fn test_group_show_by_id_prefix() {
    let data_dir = TempDir::new().unwrap();
    let id = create_group(&data_dir, "Notes");

    cli_cmd(&data_dir)
        .args(["group", "show", &id[..10]])
        .assert()
        .success()
        .stdout(predicate::str::contains("Group: Notes"))
        .stdout(predicate::str::contains("Persistent: Yes"))
        .stdout(predicate::str::contains("Entries: 0"));
}

#[test]
fn test_group_show_unknown() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["group", "show", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown group"));
}

#[test]
fn test_group_leave() {
    let data_dir = TempDir::new().unwrap();
    create_group(&data_dir, "Temporary");

    cli_cmd(&data_dir)
        .args(["group", "leave", "Temporary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Left group: Temporary"));

    cli_cmd(&data_dir)
        .args(["group", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No groups found"));
}

// ============================================================================
// Invite Tests
// ============================================================================

#[test]
fn test_invite_and_join_in_another_node() {
    let alice = TempDir::new().unwrap();
    let bob = TempDir::new().unwrap();
    let id = create_group(&alice, "Shared");

    let out = stdout_of(cli_cmd(&alice).args(["group", "invite", "Shared"]));
    let link = out
        .lines()
        .find(|l| l.starts_with("quire-join:"))
        .expect("join link in output")
        .to_string();

    cli_cmd(&bob)
        .args(["group", "join", &link])
        .assert()
        .success()
        .stdout(predicate::str::contains("Joined group: Shared"))
        .stdout(predicate::str::contains(id.as_str()));

    // Joining twice is harmless
    cli_cmd(&bob).args(["group", "join", &link]).assert().success();
    cli_cmd(&bob)
        .args(["group", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Groups (1)"));
}

#[test]
fn test_join_rejects_garbage() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["group", "join", "quire-join:not-a-link"])
        .assert()
        .failure();
}

// ============================================================================
// Entry Command Tests
// ============================================================================

#[test]
fn test_entry_append_and_list() {
    let data_dir = TempDir::new().unwrap();
    create_group(&data_dir, "Log");

    cli_cmd(&data_dir)
        .args(["entry", "append", "Log", r#"{"text": "first"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("Appended entry #0"));
    cli_cmd(&data_dir)
        .args(["entry", "append", "Log", r#"{"text": "second"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("Appended entry #1"));

    cli_cmd(&data_dir)
        .args(["entry", "list", "Log"])
        .assert()
        .success()
        .stdout(predicate::str::contains("first"))
        .stdout(predicate::str::contains("second"));

    cli_cmd(&data_dir)
        .args(["group", "show", "Log"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries: 2"))
        .stdout(predicate::str::contains("head 1"));
}

/// Each run of an ephemeral group starts an empty log under a new writer
#[test]
fn test_ephemeral_group_appends_under_new_writer_each_run() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir)
        .args(["group", "create", "--ephemeral", "Scratch"])
        .assert()
        .success();

    let first = stdout_of(cli_cmd(&data_dir).args(["entry", "append", "Scratch", r#"{"n": 1}"#]));
    let second = stdout_of(cli_cmd(&data_dir).args(["entry", "append", "Scratch", r#"{"n": 2}"#]));

    assert!(first.contains("Appended entry #0"));
    assert!(second.contains("Appended entry #0"));
    assert_ne!(
        extract_field(&first, "Writer").expect("writer in output"),
        extract_field(&second, "Writer").expect("writer in output")
    );
}

#[test]
fn test_entry_append_rejects_non_object() {
    let data_dir = TempDir::new().unwrap();
    create_group(&data_dir, "Log");

    cli_cmd(&data_dir)
        .args(["entry", "append", "Log", "[1, 2, 3]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON object"));
}

#[test]
fn test_entry_get_by_digest() {
    let data_dir = TempDir::new().unwrap();
    create_group(&data_dir, "Log");

    let out = stdout_of(cli_cmd(&data_dir).args(["entry", "append", "Log", r#"{"n": 42}"#]));
    let digest = extract_field(&out, "Digest").expect("digest in output");

    cli_cmd(&data_dir)
        .args(["entry", "get", "Log", &digest])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"n\": 42"));
}

#[test]
fn test_entry_list_empty() {
    let data_dir = TempDir::new().unwrap();
    create_group(&data_dir, "Log");

    cli_cmd(&data_dir)
        .args(["entry", "list", "Log"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No entries"));
}
