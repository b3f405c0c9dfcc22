//! Task progress commands, used by collaborators completing manual tasks and
//! by operators cleaning up after failures.

use anyhow::Result;
use console::style;
use stageflow::common::Evidence;
use std::path::Path;

use super::super::{Cli, TaskCommands};
use super::{actor, open_orchestrator};

pub async fn cmd_task(project_dir: &Path, cli: &Cli, command: TaskCommands) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    let tracker = orch.tracker();

    match command {
        TaskCommands::Start { id, task, owner } => {
            let owner = actor(owner.as_deref());
            tracker.mark_in_progress(&id, &task, &owner).await?;
            println!("{} {} (owner {})", style("Started").cyan(), task, owner);
        }
        TaskCommands::Complete {
            id,
            task,
            evidence,
            commands,
            artifacts,
            commit,
        } => {
            let mut record = Evidence::new(&evidence);
            for command in &commands {
                record = record.with_command(command);
            }
            for artifact in &artifacts {
                record = record.with_artifact(artifact);
            }
            let done = tracker.mark_completed(&id, &task, record, commit).await?;
            let hash = done
                .latest_evidence()
                .map(|e| e.content_hash.as_str())
                .unwrap_or_default();
            println!("{} {}", style("Completed").green(), task);
            println!("  Evidence: sha256:{}", hash);
        }
        TaskCommands::Fail { id, task, error } => {
            tracker.mark_failed(&id, &task, &error).await?;
            println!("{} {}: {}", style("Failed").red(), task, error);
        }
        TaskCommands::Cancel { id, task, reason } => {
            tracker.mark_cancelled(&id, &task, &reason).await?;
            println!("{} {}: {}", style("Cancelled").yellow(), task, reason);
        }
    }
    Ok(())
}

pub async fn cmd_waive(
    project_dir: &Path,
    cli: &Cli,
    id: &str,
    task: &str,
    reason: &str,
) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    orch.waive_task(id, task, reason).await?;
    println!("{} {}: {}", style("Waived").yellow(), task, reason);
    Ok(())
}

/// `retry --task T` resets one task; plain `retry` reopens the current phase.
pub async fn cmd_retry(project_dir: &Path, cli: &Cli, id: &str, task: Option<&str>) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;

    match task {
        Some(task) => {
            let reset = orch.retry_task(id, task).await?;
            println!(
                "Reset {} to pending (retry {} of {})",
                task,
                reset.attempts,
                orch.settings().max_task_retries
            );
        }
        None => {
            let state = orch.retry_phase(id).await?;
            println!(
                "{} phase {} of {}",
                style("Reopened").cyan().bold(),
                state.phase,
                id
            );
        }
    }
    Ok(())
}
