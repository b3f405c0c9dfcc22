//! Read-only status view of a workflow.

use chrono::{DateTime, Utc};
use serde::Serialize;
use stageflow_common::{
    FeatureProfile, GateRecord, Phase, ResearchMode, Task, TaskKind, TaskStatus,
    TransitionRecord, WorkflowState, WorkflowStatus,
};
use std::collections::{BTreeMap, BTreeSet};

use super::Orchestrator;
use crate::dag::Batch;
use crate::errors::Result;
use crate::gates::Settlement;

/// One task as shown by `stageflow status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub depends_on: Vec<String>,
    pub blocking: bool,
    pub waived: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Hash of the most recent evidence record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_hash: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind,
            status: task.status,
            depends_on: task.depends_on.iter().cloned().collect(),
            blocking: task.blocking,
            waived: task.waived,
            attempts: task.attempts,
            owner: task.owner.clone(),
            last_error: task.last_error.clone(),
            evidence_hash: task.latest_evidence().map(|e| e.content_hash.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub id: String,
    pub description: String,
    pub phase: Phase,
    pub status: WorkflowStatus,
    pub version: u64,
    pub profile: FeatureProfile,
    pub research_mode: ResearchMode,
    pub completed_phases: Vec<Phase>,
    pub skipped_phases: Vec<Phase>,
    pub failed_phases: BTreeSet<Phase>,
    pub signals: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateRecord>,
    pub tasks: Vec<TaskSummary>,
    pub batches: Vec<Batch>,
    /// What keeps the current phase from advancing
    pub blockers: Vec<String>,
    /// In-progress tasks untouched for longer than timeout plus grace,
    /// usually left behind by a crashed run
    pub stale_tasks: Vec<String>,
    pub history: Vec<TransitionRecord>,
    pub updated_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn build(state: &WorkflowState, orch: &Orchestrator) -> Result<Self> {
        Self::build_at(state, orch, Utc::now())
    }

    pub fn build_at(state: &WorkflowState, orch: &Orchestrator, now: DateTime<Utc>) -> Result<Self> {
        let settings = orch.settings();
        let tasks = state.current_tasks();
        let settlement = Settlement::compute(&tasks, settings.failure_tolerance);
        let stale_after = settings.task_timeout + settings.cancellation_grace;

        let stale_tasks = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter(|t| {
                (now - t.updated_at)
                    .to_std()
                    .is_ok_and(|age| age > stale_after)
            })
            .map(|t| t.id.clone())
            .collect();

        Ok(Self {
            id: state.id.clone(),
            description: state.description.clone(),
            phase: state.phase,
            status: state.status,
            version: state.version,
            profile: state.profile,
            research_mode: state.profile.research_mode(),
            completed_phases: state.completed_phases.clone(),
            skipped_phases: state.skipped_phases.clone(),
            failed_phases: state.failed_phases.clone(),
            signals: state.signals.clone(),
            gate: state.gate_for_phase(state.phase).cloned(),
            tasks: tasks.iter().map(|t| TaskSummary::from(*t)).collect(),
            batches: orch.batches(state)?,
            blockers: settlement.blockers,
            stale_tasks,
            history: state.history.clone(),
            updated_at: state.updated_at,
        })
    }
}
