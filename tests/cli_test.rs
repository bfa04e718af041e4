#![allow(missing_docs)]
// CLI smoke tests for the offline subcommands.

use assert_cmd::Command;
use tempfile::TempDir;

fn armitage() -> Command {
    Command::cargo_bin("armitage").expect("binary builds")
}

fn stdout_of(assert: assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).into_owned()
}

#[test]
fn test_status_on_empty_directory() {
    let dir = TempDir::new().expect("tempdir");
    let assert = armitage()
        .current_dir(dir.path())
        .args(["status"])
        .assert()
        .success();
    let out = stdout_of(assert);
    assert!(out.contains("phase: CLARIFY"), "unexpected output: {out}");
    assert!(out.contains("epic: none"));
}

#[test]
fn test_resume_reports_empty_stream() {
    let dir = TempDir::new().expect("tempdir");
    let assert = armitage()
        .current_dir(dir.path())
        .args(["resume"])
        .assert()
        .success();
    let out = stdout_of(assert);
    assert!(out.contains("Nothing to recover"), "unexpected output: {out}");
}

#[test]
fn test_gc_reports_zero_on_fresh_directory() {
    let dir = TempDir::new().expect("tempdir");
    let assert = armitage()
        .current_dir(dir.path())
        .args(["gc", "--hours", "48"])
        .assert()
        .success();
    let out = stdout_of(assert);
    assert!(out.contains("removed 0 snapshot(s)"), "unexpected output: {out}");
}

#[test]
fn test_check_validates_workflow_document() {
    let dir = TempDir::new().expect("tempdir");
    let file = dir.path().join("ship.md");
    std::fs::write(
        &file,
        "---\nname: ship\nentry_agent: planner\n---\n\n## Phase 1: Plan\n\n- Agent: planner\n  - Prompt: \"Plan {{task}}\"\n",
    )
    .expect("write");

    let assert = armitage()
        .current_dir(dir.path())
        .args(["check", "ship.md"])
        .assert()
        .success();
    let out = stdout_of(assert);
    assert!(out.contains("workflow 'ship'"), "unexpected output: {out}");
}

#[test]
fn test_check_rejects_malformed_document() {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("broken.md"), "no frontmatter here").expect("write");

    armitage()
        .current_dir(dir.path())
        .args(["check", "broken.md"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_malformed_config_is_a_config_error() {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("armitage.toml"), "not toml [").expect("write");
    armitage()
        .current_dir(dir.path())
        .args(["status"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_status_after_activity_in_directory() {
    use armitage::ledger::LedgerStore;

    let dir = TempDir::new().expect("tempdir");
    let ledger = LedgerStore::new(dir.path().join(".opencode"), "ses_seed");
    ledger.initialize().expect("init");
    ledger.create_epic("Build Auth", "OAuth please").expect("epic");
    ledger
        .create_task("Design schema", "planner", vec![])
        .expect("task");

    let assert = armitage()
        .current_dir(dir.path())
        .args(["status"])
        .assert()
        .success();
    let out = stdout_of(assert);
    assert!(out.contains("Build Auth"), "unexpected output: {out}");
    assert!(out.contains("tasks: 0/1"), "unexpected output: {out}");
}
