//! Workflow lifecycle commands: init, start, declare, continue, status, list,
//! rollback, signal and archive.

use anyhow::{Context, Result};
use console::style;
use stageflow::common::{Phase, TaskDeclaration, TaskStatus, WorkflowStatus};
use stageflow::dag::LayerEvent;
use stageflow::orchestrator::{Advance, RunReport, StatusReport};
use stageflow::stageflow_config::StageflowToml;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::super::Cli;
use super::{load_config, open_orchestrator};

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = stageflow::config::Config::new(project_dir, false)?;
    let was_initialized = config.is_initialized();
    config.ensure_directories()?;

    if !config.config_file.exists() {
        StageflowToml::default().save(&config.config_file)?;
    }

    if was_initialized {
        println!(
            "Stageflow project already initialized at {}",
            config.stageflow_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!(
        "Initialized stageflow project at {}",
        config.stageflow_dir.display()
    );
    println!();
    println!("Created directory structure:");
    println!("  .stageflow/");
    println!("  ├── stageflow.toml  # Batch size, tolerance, gates, skip rules");
    println!("  ├── state/          # One JSON document per workflow");
    println!("  ├── archive/        # Archived workflows");
    println!("  └── logs/");
    println!();
    println!("Next steps:");
    println!("  1. Run `stageflow start \"<feature description>\"`");
    println!("  2. Run `stageflow declare <id> tasks.json` to attach tasks");
    println!("  3. Run `stageflow continue <id>` to execute and advance");
    Ok(())
}

pub fn cmd_start(
    project_dir: &Path,
    cli: &Cli,
    description: &str,
    id: Option<&str>,
) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    let state = orch.start(description, id)?;

    println!(
        "{} workflow {} at phase {}",
        style("Started").green().bold(),
        style(&state.id).bold(),
        state.phase
    );
    println!("  Research mode: {}", state.profile.research_mode());
    Ok(())
}

pub async fn cmd_declare(project_dir: &Path, cli: &Cli, id: &str, file: &Path) -> Result<()> {
    let raw = if file == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("Failed to read tasks from stdin")?
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read task file: {}", file.display()))?
    };
    let decls: Vec<TaskDeclaration> =
        serde_json::from_str(&raw).context("Task file must be a JSON list of task objects")?;

    let orch = open_orchestrator(project_dir, cli)?;
    let state = orch.declare_tasks(id, decls).await?;
    let batches = orch.batches(&state)?;

    println!(
        "Declared {} task(s) for phase {} in {} batch(es)",
        state.current_tasks().len(),
        state.phase,
        batches.len()
    );
    for batch in &batches {
        println!("  {}: {}", batch.layer + 1, batch.tasks.join(", "));
    }
    Ok(())
}

pub async fn cmd_continue(project_dir: &Path, cli: &Cli, id: &str, json: bool) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after running tasks settle");
                cancel.cancel();
            }
        })
    };

    let (tx, mut rx) = mpsc::channel::<LayerEvent>(64);
    let orch = if json {
        drop(tx);
        orch
    } else {
        orch.with_event_channel(tx)
    };
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let result = orch.run(id, &cancel).await;
    drop(orch);
    let _ = printer.await;
    interrupt.abort();

    let report = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(id, &report);
    }
    report.into_result()?;
    Ok(())
}

fn print_event(event: &LayerEvent) {
    match event {
        LayerEvent::BatchStarted { index, tasks } => {
            println!(
                "{} Batch {}: {}",
                style("▶").cyan(),
                index + 1,
                tasks.join(", ")
            );
        }
        LayerEvent::TaskFinished { task, status } => {
            let marker = match status {
                TaskStatus::Completed => style("✓").green(),
                TaskStatus::Failed => style("✗").red(),
                TaskStatus::Cancelled => style("⊘").yellow(),
                TaskStatus::Pending | TaskStatus::InProgress => style("·").dim(),
            };
            println!("  {} {} {}", marker, task, style(status).dim());
        }
        LayerEvent::BatchFinished { .. } => {}
    }
}

fn print_run_report(id: &str, report: &RunReport) {
    if report.cancelled {
        println!(
            "{}",
            style("Run cancelled. State is saved; `stageflow continue` resumes.").yellow()
        );
    }

    match &report.outcome {
        None => {}
        Some(Advance::Advanced { from, to, .. }) => {
            println!("{} {} → {}", style("Advanced").green(), from, to)
        }
        Some(Advance::Completed) => {
            println!("{}", style("Workflow completed.").green().bold())
        }
        Some(Advance::AlreadyCompleted) => println!("Workflow already completed."),
        Some(Advance::Blocked { phase, blockers }) => {
            println!("{} at phase {}:", style("Blocked").yellow().bold(), phase);
            for blocker in blockers {
                println!("  - {}", blocker);
            }
        }
        Some(Advance::GatePending { phase, gate }) => {
            println!(
                "{} gate '{}' guards phase {}",
                style("Waiting:").yellow().bold(),
                gate,
                phase
            );
            println!("  Approve with: stageflow approve {} {}", id, gate);
        }
        Some(Advance::GateRejected { phase, gate, reason }) => {
            println!(
                "{} gate '{}' rejected phase {}: {}",
                style("Failed:").red().bold(),
                gate,
                phase,
                reason
            );
            println!("  Reopen with: stageflow retry {}", id);
        }
    }
}

pub fn cmd_status(project_dir: &Path, cli: &Cli, id: &str, json: bool) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    let report = orch.status(id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status(&report);
    }
    Ok(())
}

fn join_phases(phases: impl IntoIterator<Item = Phase>) -> String {
    let names: Vec<&str> = phases.into_iter().map(|p| p.as_str()).collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

fn styled_status(status: WorkflowStatus) -> console::StyledObject<WorkflowStatus> {
    match status {
        WorkflowStatus::Completed => style(status).green(),
        WorkflowStatus::Failed => style(status).red(),
        WorkflowStatus::InProgress => style(status).cyan(),
        WorkflowStatus::Pending => style(status).dim(),
    }
}

fn print_status(report: &StatusReport) {
    println!();
    println!("{}", style(format!("Workflow {}", report.id)).bold().cyan());
    if !report.description.is_empty() {
        println!("  {}", report.description);
    }
    println!(
        "  Phase:     {} ({})   version {}",
        report.phase,
        styled_status(report.status),
        report.version
    );
    println!("  Research:  {}", report.research_mode);
    println!("  Completed: {}", join_phases(report.completed_phases.iter().copied()));
    println!("  Skipped:   {}", join_phases(report.skipped_phases.iter().copied()));
    if !report.failed_phases.is_empty() {
        println!(
            "  Failed:    {}",
            style(join_phases(report.failed_phases.iter().copied())).red()
        );
    }
    for (name, value) in &report.signals {
        println!("  Signal:    {} = {}", name, value);
    }

    match &report.gate {
        Some(gate) => {
            let mut line = format!("  Gate:      {} [{}] {}", gate.name, gate.kind, gate.status);
            if let Some(approver) = &gate.approver {
                line.push_str(&format!(" by {}", approver));
            }
            if let Some(reason) = &gate.reason {
                line.push_str(&format!(": {}", reason));
            }
            println!("{}", line);
            if !gate.votes.is_empty() {
                println!("  Votes:     {}", gate.votes.len());
            }
        }
        None => println!("  Gate:      none"),
    }

    if !report.tasks.is_empty() {
        println!();
        println!(
            "  {:<16} {:<8} {:<12} {}",
            "Task", "Kind", "Status", "Depends on"
        );
        for task in &report.tasks {
            let status = if task.waived {
                format!("{} (waived)", task.status)
            } else {
                task.status.to_string()
            };
            println!(
                "  {:<16} {:<8} {:<12} {}",
                task.id,
                task.kind.to_string(),
                status,
                task.depends_on.join(", ")
            );
        }
        println!();
        for batch in &report.batches {
            println!("  Batch {}: {}", batch.layer + 1, batch.tasks.join(", "));
        }
    }

    if !report.blockers.is_empty() {
        println!();
        println!("  {}", style("Blockers:").yellow().bold());
        for blocker in &report.blockers {
            println!("    - {}", blocker);
        }
    }
    if !report.stale_tasks.is_empty() {
        println!();
        println!(
            "  {} {}",
            style("Stale in-progress tasks:").yellow(),
            report.stale_tasks.join(", ")
        );
    }
    println!();
}

pub fn cmd_list(project_dir: &Path, cli: &Cli, json: bool) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    let workflows = orch.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }
    if workflows.is_empty() {
        println!("No active workflows. Start one with `stageflow start`.");
        return Ok(());
    }

    println!("{:<32} {:<10} {:<12} {}", "Workflow", "Phase", "Status", "Version");
    for state in &workflows {
        println!(
            "{:<32} {:<10} {:<12} {}",
            state.id,
            state.phase.as_str(),
            state.status.to_string(),
            state.version
        );
    }
    Ok(())
}

pub async fn cmd_rollback(
    project_dir: &Path,
    cli: &Cli,
    id: &str,
    target: Phase,
    reason: &str,
) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    let state = orch.rollback(id, target, reason).await?;
    println!(
        "{} {} to phase {}",
        style("Rolled back").yellow().bold(),
        state.id,
        state.phase
    );
    Ok(())
}

pub async fn cmd_signal(
    project_dir: &Path,
    cli: &Cli,
    id: &str,
    name: &str,
    value: f64,
) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    orch.record_signal(id, name, value).await?;
    println!("Recorded signal {} = {} on {}", name, value, id);
    Ok(())
}

pub fn cmd_archive(project_dir: &Path, cli: &Cli, id: &str) -> Result<()> {
    let config = load_config(project_dir, cli)?;
    let orch = open_orchestrator(project_dir, cli)?;
    orch.archive(id)?;
    println!(
        "Archived {} to {}",
        id,
        config.archive_dir.display()
    );
    Ok(())
}
