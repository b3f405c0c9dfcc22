//! Integration tests for the stageflow CLI.
//!
//! Each test drives the binary against its own temporary project directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a stageflow Command rooted at `dir`
fn stageflow(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("stageflow");
    cmd.current_dir(dir.path())
        .env_remove("STAGEFLOW_MAX_BATCH_SIZE")
        .env_remove("STAGEFLOW_FAILURE_TOLERANCE")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper to create an initialized project
fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    stageflow(&dir).arg("init").assert().success();
    dir
}

fn start(dir: &TempDir, id: &str) {
    stageflow(dir)
        .args(["start", "Add rate limiting to the login endpoint", "--id", id])
        .assert()
        .success();
}

fn write_tasks(dir: &TempDir, json: &str) -> String {
    let path = dir.path().join("tasks.json");
    fs::write(&path, json).unwrap();
    path.display().to_string()
}

fn status_json(dir: &TempDir, id: &str) -> serde_json::Value {
    let output = stageflow(dir)
        .args(["status", id, "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_stageflow_help() {
        cargo_bin_cmd!("stageflow").arg("--help").assert().success();
    }

    #[test]
    fn test_stageflow_version() {
        cargo_bin_cmd!("stageflow")
            .arg("--version")
            .assert()
            .success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();

        stageflow(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized stageflow project"));

        assert!(dir.path().join(".stageflow/state").is_dir());
        assert!(dir.path().join(".stageflow/archive").is_dir());
        assert!(dir.path().join(".stageflow/stageflow.toml").exists());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = init_project();
        stageflow(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_commands_require_init() {
        let dir = TempDir::new().unwrap();
        stageflow(&dir)
            .args(["start", "anything"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("stageflow init"));
    }

    #[test]
    fn test_unknown_workflow_is_validation_error() {
        let dir = init_project();
        stageflow(&dir)
            .args(["status", "missing"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Workflow 'missing' not found"));
    }
}

// =============================================================================
// Workflow lifecycle
// =============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_start_slugs_description() {
        let dir = init_project();
        stageflow(&dir)
            .args(["start", "We want to add the user dashboard"])
            .assert()
            .success()
            .stdout(predicate::str::contains("add-user-dashboard"));

        assert!(
            dir.path()
                .join(".stageflow/state/add-user-dashboard.json")
                .exists()
        );

        stageflow(&dir)
            .args(["start", "We want to add the user dashboard"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_continue_stops_at_manual_gate_then_completes() {
        let dir = init_project();
        start(&dir, "wf");

        stageflow(&dir)
            .args(["continue", "wf"])
            .assert()
            .code(2)
            .stdout(predicate::str::contains("plan-review"));

        let status = status_json(&dir, "wf");
        assert_eq!(status["phase"], "plan");
        assert_eq!(status["gate"]["status"], "pending");

        stageflow(&dir)
            .args(["approve", "wf", "plan-review", "--by", "alice"])
            .assert()
            .success();

        stageflow(&dir)
            .args(["continue", "wf"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Workflow completed"));

        let status = status_json(&dir, "wf");
        assert_eq!(status["status"], "completed");
        assert_eq!(status["completed_phases"].as_array().unwrap().len(), 8);

        // Continuing a finished workflow is a no-op
        stageflow(&dir)
            .args(["continue", "wf"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already completed"));
    }

    #[test]
    fn test_reject_then_retry_phase() {
        let dir = init_project();
        start(&dir, "wf");
        stageflow(&dir).args(["continue", "wf"]).assert().code(2);

        stageflow(&dir)
            .args(["reject", "wf", "plan-review", "missing rollout plan"])
            .assert()
            .success();
        stageflow(&dir)
            .args(["continue", "wf"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("missing rollout plan"));

        stageflow(&dir).args(["retry", "wf"]).assert().success();
        let status = status_json(&dir, "wf");
        assert_eq!(status["status"], "in_progress");
        assert_eq!(status["gate"]["status"], "pending");
    }

    #[test]
    fn test_signal_skips_clarify() {
        let dir = init_project();
        start(&dir, "wf");
        stageflow(&dir)
            .args(["signal", "wf", "ambiguity", "1"])
            .assert()
            .success();
        stageflow(&dir).args(["continue", "wf"]).assert().code(2);

        let status = status_json(&dir, "wf");
        assert_eq!(status["skipped_phases"], serde_json::json!(["clarify"]));
    }

    #[test]
    fn test_rollback_requires_earlier_phase() {
        let dir = init_project();
        start(&dir, "wf");
        stageflow(&dir).args(["continue", "wf"]).assert().code(2);

        stageflow(&dir)
            .args(["rollback", "wf", "ship", "forward"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("earlier phase"));

        stageflow(&dir)
            .args(["rollback", "wf", "spec", "requirements changed"])
            .assert()
            .success();
        let status = status_json(&dir, "wf");
        assert_eq!(status["phase"], "spec");
        assert_eq!(status["failed_phases"], serde_json::json!(["plan"]));
    }

    #[test]
    fn test_list_and_archive() {
        let dir = init_project();
        start(&dir, "wf");

        stageflow(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("wf"));

        stageflow(&dir).args(["archive", "wf"]).assert().success();
        stageflow(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No active workflows"));
    }
}

// =============================================================================
// Tasks
// =============================================================================

mod tasks {
    use super::*;

    const LAYERED: &str = r#"[
        {"id": "T1", "kind": "build", "command": "echo broken >&2; exit 1"},
        {"id": "T2", "kind": "build", "command": "echo ok"},
        {"id": "T3", "kind": "test", "command": "echo never", "depends_on": ["T1", "T2"]}
    ]"#;

    #[test]
    fn test_declare_reports_batches() {
        let dir = init_project();
        start(&dir, "wf");
        let file = write_tasks(&dir, LAYERED);

        stageflow(&dir)
            .args(["declare", "wf", &file])
            .assert()
            .success()
            .stdout(predicate::str::contains("1: T1, T2"))
            .stdout(predicate::str::contains("2: T3"));
    }

    #[test]
    fn test_declare_rejects_cycle() {
        let dir = init_project();
        start(&dir, "wf");
        let file = write_tasks(
            &dir,
            r#"[{"id": "A", "depends_on": ["B"]}, {"id": "B", "depends_on": ["A"]}]"#,
        );

        stageflow(&dir)
            .args(["declare", "wf", &file])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("A -> B -> A"));
    }

    #[test]
    fn test_failed_task_blocks_dependent() {
        let dir = init_project();
        start(&dir, "wf");
        let file = write_tasks(&dir, LAYERED);
        stageflow(&dir).args(["declare", "wf", &file]).assert().success();

        stageflow(&dir)
            .args(["continue", "wf"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("spec-complete"));

        let status = status_json(&dir, "wf");
        let tasks = status["tasks"].as_array().unwrap();
        let by_id = |id: &str| tasks.iter().find(|t| t["id"] == id).unwrap().clone();
        assert_eq!(by_id("T1")["status"], "failed");
        assert_eq!(by_id("T1")["last_error"], "exit code 1: broken");
        assert_eq!(by_id("T2")["status"], "completed");
        assert_eq!(by_id("T3")["status"], "pending");
        assert_eq!(status["status"], "failed");
    }

    #[test]
    fn test_retry_task_respects_limit() {
        let dir = init_project();
        start(&dir, "wf");
        let file = write_tasks(&dir, r#"[{"id": "T1", "kind": "build", "command": "exit 1"}]"#);
        stageflow(&dir).args(["declare", "wf", &file]).assert().success();
        stageflow(&dir).args(["continue", "wf"]).assert().code(2);

        stageflow(&dir)
            .args(["retry", "wf", "--task", "T1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("retry 1 of 3"));

        // Pending again: a second reset has nothing to retry
        stageflow(&dir)
            .args(["retry", "wf", "--task", "T1"])
            .assert()
            .code(1);
    }

    #[test]
    fn test_manual_task_completed_with_evidence() {
        let dir = init_project();
        start(&dir, "wf");
        let file = write_tasks(&dir, r#"[{"id": "M1", "description": "write the spec"}]"#);
        stageflow(&dir).args(["declare", "wf", &file]).assert().success();

        stageflow(&dir)
            .args(["continue", "wf"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("M1 (pending)"));

        stageflow(&dir)
            .args(["task", "complete", "wf", "M1", "--evidence", "done"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("cannot move from pending"));

        stageflow(&dir)
            .args(["task", "start", "wf", "M1", "--owner", "bob"])
            .assert()
            .success();
        stageflow(&dir)
            .args([
                "task",
                "complete",
                "wf",
                "M1",
                "--evidence",
                "spec written",
                "--artifact",
                "docs/spec.md",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("sha256:"));

        stageflow(&dir).args(["continue", "wf"]).assert().code(2);
        assert_eq!(status_json(&dir, "wf")["phase"], "plan");
    }

    #[test]
    fn test_waive_unblocks_phase() {
        let dir = init_project();
        start(&dir, "wf");
        let file = write_tasks(&dir, r#"[{"id": "M1"}]"#);
        stageflow(&dir).args(["declare", "wf", &file]).assert().success();

        stageflow(&dir)
            .args(["waive", "wf", "M1", "covered elsewhere"])
            .assert()
            .success();
        stageflow(&dir).args(["continue", "wf"]).assert().code(2);
        assert_eq!(status_json(&dir, "wf")["phase"], "plan");
    }

    #[test]
    fn test_content_task_writes_file() {
        let dir = init_project();
        start(&dir, "wf");
        let file = write_tasks(
            &dir,
            r##"[{"id": "doc", "kind": "content", "output": "docs/spec.md", "content": "# Spec\n"}]"##,
        );
        stageflow(&dir).args(["declare", "wf", &file]).assert().success();
        stageflow(&dir).args(["continue", "wf"]).assert().code(2);

        assert_eq!(
            fs::read_to_string(dir.path().join("docs/spec.md")).unwrap(),
            "# Spec\n"
        );
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        stageflow(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No stageflow.toml found"))
            .stdout(predicate::str::contains("max_batch_size = 8"))
            .stdout(predicate::str::contains("plan-review"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = TempDir::new().unwrap();
        stageflow(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created stageflow.toml"));

        let content = fs::read_to_string(dir.path().join(".stageflow/stageflow.toml")).unwrap();
        assert!(content.contains("[defaults]"));
    }

    #[test]
    fn test_config_validate_reports_errors() {
        let dir = init_project();
        fs::write(
            dir.path().join(".stageflow/stageflow.toml"),
            "[defaults]\nmax_batch_size = 20\n",
        )
        .unwrap();

        stageflow(&dir)
            .args(["config", "validate"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("max_batch_size 20 is outside 3..=8"));
    }

    #[test]
    fn test_env_and_cli_overrides() {
        let dir = init_project();

        stageflow(&dir)
            .env("STAGEFLOW_MAX_BATCH_SIZE", "4")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_batch_size = 4"));

        stageflow(&dir)
            .env("STAGEFLOW_MAX_BATCH_SIZE", "4")
            .args(["--max-batch-size", "5", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_batch_size = 5"));
    }
}
