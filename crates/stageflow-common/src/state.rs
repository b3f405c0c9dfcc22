//! The persisted workflow document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::gate::GateRecord;
use crate::phase::{Phase, WorkflowStatus};
use crate::task::Task;

/// Keyword-derived traits of a feature, used by skip and auto-approve rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureProfile {
    #[serde(default)]
    pub has_ui: bool,
    #[serde(default)]
    pub is_improvement: bool,
    #[serde(default)]
    pub has_metrics: bool,
    #[serde(default)]
    pub has_deployment_impact: bool,
}

impl FeatureProfile {
    pub fn flag_count(&self) -> usize {
        [
            self.has_ui,
            self.is_improvement,
            self.has_metrics,
            self.has_deployment_impact,
        ]
        .iter()
        .filter(|f| **f)
        .count()
    }

    pub fn research_mode(&self) -> ResearchMode {
        match self.flag_count() {
            0 => ResearchMode::Minimal,
            1 => ResearchMode::Standard,
            _ => ResearchMode::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    Minimal,
    Standard,
    Full,
}

impl std::fmt::Display for ResearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResearchMode::Minimal => write!(f, "minimal"),
            ResearchMode::Standard => write!(f, "standard"),
            ResearchMode::Full => write!(f, "full"),
        }
    }
}

/// What moved a workflow between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Started,
    Advanced,
    Skipped,
    Failed,
    PhaseRetried,
    RolledBack,
    Completed,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionKind::Started => "started",
            TransitionKind::Advanced => "advanced",
            TransitionKind::Skipped => "skipped",
            TransitionKind::Failed => "failed",
            TransitionKind::PhaseRetried => "phase_retried",
            TransitionKind::RolledBack => "rolled_back",
            TransitionKind::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// One line of the workflow's transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub at: DateTime<Utc>,
    pub kind: TransitionKind,
    pub from: Phase,
    pub to: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Durable state of one unit of work (a feature or epic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub phase: Phase,
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Phases left behind, in the order they were completed
    #[serde(default)]
    pub completed_phases: Vec<Phase>,
    #[serde(default)]
    pub failed_phases: BTreeSet<Phase>,
    /// Subset of `completed_phases` that a skip rule passed over
    #[serde(default)]
    pub skipped_phases: Vec<Phase>,
    #[serde(default)]
    pub gates: BTreeMap<String, GateRecord>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub profile: FeatureProfile,
    /// Named numeric inputs for skip predicates (e.g. `ambiguity`)
    #[serde(default)]
    pub signals: BTreeMap<String, f64>,
    /// Append-only log of phase transitions
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(id: &str, description: &str, profile: FeatureProfile) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            description: description.to_string(),
            phase: Phase::Spec,
            status: WorkflowStatus::Pending,
            completed_phases: Vec::new(),
            failed_phases: BTreeSet::new(),
            skipped_phases: Vec::new(),
            gates: BTreeMap::new(),
            tasks: Vec::new(),
            profile,
            signals: BTreeMap::new(),
            history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Tasks declared for `phase`, in declaration order.
    pub fn phase_tasks(&self, phase: Phase) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.phase == phase)
    }

    pub fn current_tasks(&self) -> Vec<&Task> {
        self.phase_tasks(self.phase).collect()
    }

    pub fn task(&self, phase: Phase, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.phase == phase && t.id == id)
    }

    pub fn task_mut(&mut self, phase: Phase, id: &str) -> Option<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.phase == phase && t.id == id)
    }

    pub fn gate_for_phase(&self, phase: Phase) -> Option<&GateRecord> {
        self.gates.values().find(|g| g.phase == phase)
    }

    pub fn is_phase_completed(&self, phase: Phase) -> bool {
        self.completed_phases.contains(&phase)
    }

    pub fn record_transition(
        &mut self,
        kind: TransitionKind,
        from: Phase,
        to: Phase,
        reason: Option<String>,
    ) {
        self.history.push(TransitionRecord {
            at: Utc::now(),
            kind,
            from,
            to,
            reason,
        });
    }

    /// Record `phase` as completed, keeping the list free of duplicates.
    pub fn mark_phase_completed(&mut self, phase: Phase) {
        if !self.completed_phases.contains(&phase) {
            self.completed_phases.push(phase);
        }
    }
}
