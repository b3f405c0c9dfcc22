//! Build and test tasks: run a shell command in the project directory.

use async_trait::async_trait;
use stageflow_common::{Evidence, Task};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{ExecutionContext, ExecutionOutcome, MAX_CAPTURED_OUTPUT, TaskExecutor, tail};
use crate::errors::{Result, StageflowError};

/// Runs `task.command` through `sh -c`.
///
/// The child is killed when its future is dropped, which covers both the
/// per-task timeout and an abort after the cancellation grace period.
pub struct CommandExecutor;

impl CommandExecutor {
    fn command_of(task: &Task) -> Option<&str> {
        task.command.as_deref().filter(|c| !c.trim().is_empty())
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    fn name(&self) -> &'static str {
        "command"
    }

    fn validate(&self, task: &Task) -> Result<()> {
        match Self::command_of(task) {
            Some(_) => Ok(()),
            None => Err(StageflowError::InvalidTask {
                task: task.id.clone(),
                message: format!("{} task has no command", task.kind),
            }),
        }
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> ExecutionOutcome {
        let Some(command) = Self::command_of(task) else {
            return ExecutionOutcome::Failed("no command to run".to_string());
        };

        debug!(workflow = %ctx.workflow, task = %task.id, command = %command, "Spawning task command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("STAGEFLOW_WORKFLOW", &ctx.workflow)
            .env("STAGEFLOW_PHASE", ctx.phase.as_str())
            .env("STAGEFLOW_TASK", &task.id)
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return ExecutionOutcome::Failed(format!("failed to spawn '{}': {}", command, e)),
        };

        let output = tokio::select! {
            result = timeout(ctx.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return ExecutionOutcome::Failed(format!("failed to wait for '{}': {}", command, e));
                }
                Err(_) => {
                    return ExecutionOutcome::Failed(format!(
                        "timed out after {} seconds",
                        ctx.timeout.as_secs()
                    ));
                }
            },
            _ = ctx.cancel.cancelled() => return ExecutionOutcome::Cancelled,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            let detail = stderr
                .lines()
                .rev()
                .chain(stdout.lines().rev())
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("no output");
            return ExecutionOutcome::Failed(format!("exit code {}: {}", code, detail));
        }

        let mut captured = stdout.trim_end().to_string();
        if !stderr.trim().is_empty() {
            if !captured.is_empty() {
                captured.push('\n');
            }
            captured.push_str(stderr.trim_end());
        }

        let mut evidence = Evidence::new(&format!("{} command exited 0", task.kind)).with_command(command);
        if !captured.is_empty() {
            evidence = evidence.with_output(tail(&captured, MAX_CAPTURED_OUTPUT));
        }
        ExecutionOutcome::Succeeded(evidence)
    }
}
