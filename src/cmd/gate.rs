//! Gate decision commands: approve, reject, vote.

use anyhow::Result;
use console::style;
use stageflow::common::VoteDecision;
use stageflow::gates::GateVerdict;
use std::path::Path;

use super::super::Cli;
use super::{actor, open_orchestrator};

pub async fn cmd_approve(
    project_dir: &Path,
    cli: &Cli,
    id: &str,
    gate: &str,
    by: Option<&str>,
) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    let approver = actor(by);
    orch.approve(id, gate, &approver).await?;
    println!(
        "{} gate '{}' on {} (by {})",
        style("Approved").green().bold(),
        gate,
        id,
        approver
    );
    println!("  Advance with: stageflow continue {}", id);
    Ok(())
}

pub async fn cmd_reject(
    project_dir: &Path,
    cli: &Cli,
    id: &str,
    gate: &str,
    reason: &str,
    by: Option<&str>,
) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    let approver = actor(by);
    let state = orch.reject(id, gate, &approver, reason).await?;
    println!(
        "{} gate '{}' on {}: {}",
        style("Rejected").red().bold(),
        gate,
        id,
        reason
    );
    println!(
        "  Workflow failed at phase {}. Reopen with: stageflow retry {}",
        state.phase, id
    );
    Ok(())
}

pub async fn cmd_vote(
    project_dir: &Path,
    cli: &Cli,
    id: &str,
    gate: &str,
    decision: VoteDecision,
    voter: Option<&str>,
    weight: f64,
) -> Result<()> {
    let orch = open_orchestrator(project_dir, cli)?;
    let voter = actor(voter);
    let (verdict, state) = orch.vote(id, gate, &voter, decision, weight).await?;

    let votes = state.gates.get(gate).map(|g| g.votes.len()).unwrap_or(0);
    match verdict {
        GateVerdict::Approved => println!(
            "{} gate '{}' after {} vote(s)",
            style("Approved").green().bold(),
            gate,
            votes
        ),
        GateVerdict::Rejected(reason) => println!(
            "{} gate '{}': {}",
            style("Rejected").red().bold(),
            gate,
            reason
        ),
        GateVerdict::Pending => println!(
            "Vote recorded for {} on gate '{}' ({} vote(s), undecided)",
            voter, gate, votes
        ),
    }
    Ok(())
}
