//! Content tasks: write a declared body to a file under the project.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use stageflow_common::{Evidence, Task};
use std::path::{Component, Path};

use super::{ExecutionContext, ExecutionOutcome, TaskExecutor};
use crate::errors::{Result, StageflowError};

pub struct ContentExecutor;

fn invalid(task: &Task, message: &str) -> StageflowError {
    StageflowError::InvalidTask {
        task: task.id.clone(),
        message: message.to_string(),
    }
}

/// Output paths stay inside the project directory.
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
impl TaskExecutor for ContentExecutor {
    fn name(&self) -> &'static str {
        "content"
    }

    fn validate(&self, task: &Task) -> Result<()> {
        let output = task
            .output
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| invalid(task, "content task has no output path"))?;
        if task.content.is_none() {
            return Err(invalid(task, "content task has no content"));
        }
        if !is_contained(Path::new(output)) {
            return Err(invalid(
                task,
                &format!("output path '{}' must be relative to the project", output),
            ));
        }
        Ok(())
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> ExecutionOutcome {
        if let Err(e) = self.validate(task) {
            return ExecutionOutcome::Failed(e.to_string());
        }
        if ctx.cancel.is_cancelled() {
            return ExecutionOutcome::Cancelled;
        }

        let (Some(output), Some(content)) = (task.output.as_deref(), task.content.as_deref()) else {
            return ExecutionOutcome::Failed("content task is incomplete".to_string());
        };
        let path = ctx.project_dir.join(output);

        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return ExecutionOutcome::Failed(format!("failed to create {}: {}", parent.display(), e));
        }
        if let Err(e) = tokio::fs::write(&path, content).await {
            return ExecutionOutcome::Failed(format!("failed to write {}: {}", path.display(), e));
        }

        let digest = format!("{:x}", Sha256::digest(content.as_bytes()));
        ExecutionOutcome::Succeeded(
            Evidence::new(&format!("wrote {} bytes to {}", content.len(), output))
                .with_artifact(output)
                .with_artifact(&format!("sha256:{}", digest)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageflow_common::{Phase, TaskDeclaration};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn task(output: &str, content: &str) -> Task {
        Task::from_declaration(
            TaskDeclaration::new("doc", "write docs", vec![]).with_content(output, content),
            Phase::Plan,
        )
    }

    fn ctx(dir: &Path) -> ExecutionContext {
        ExecutionContext {
            workflow: "wf".into(),
            phase: Phase::Plan,
            project_dir: dir.to_path_buf(),
            timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_validate_rejects_escaping_paths() {
        assert!(ContentExecutor.validate(&task("docs/plan.md", "x")).is_ok());
        assert!(ContentExecutor.validate(&task("../outside.md", "x")).is_err());
        assert!(ContentExecutor.validate(&task("/etc/passwd", "x")).is_err());
        assert!(ContentExecutor.validate(&task("", "x")).is_err());
    }

    #[tokio::test]
    async fn test_writes_nested_output() {
        let dir = tempdir().unwrap();
        let outcome = ContentExecutor
            .execute(&task("docs/plan.md", "# Plan\n"), &ctx(dir.path()))
            .await;

        let written = std::fs::read_to_string(dir.path().join("docs/plan.md")).unwrap();
        assert_eq!(written, "# Plan\n");
        match outcome {
            ExecutionOutcome::Succeeded(evidence) => {
                assert_eq!(evidence.artifacts[0], "docs/plan.md");
                assert!(evidence.artifacts[1].starts_with("sha256:"));
                assert_eq!(evidence.artifacts[1].len(), "sha256:".len() + 64);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_write() {
        let dir = tempdir().unwrap();
        let context = ctx(dir.path());
        context.cancel.cancel();
        let outcome = ContentExecutor.execute(&task("out.md", "body"), &context).await;
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert!(!dir.path().join("out.md").exists());
    }
}
