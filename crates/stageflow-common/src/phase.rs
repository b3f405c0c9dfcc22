//! The fixed phase order and workflow-level status.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing domain enums from user input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error(
        "Unknown phase '{0}'. Valid values: spec, clarify, plan, tasks, implement, optimize, ship, finalize"
    )]
    UnknownPhase(String),

    #[error("Unknown vote '{0}'. Valid values: approve, reject, abstain")]
    UnknownVote(String),

    #[error("Unknown task kind '{0}'. Valid values: manual, build, test, content")]
    UnknownTaskKind(String),
}

/// A stage in the delivery pipeline.
///
/// Variants are declared in pipeline order, so the derived `Ord` is the
/// total order phases advance through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Spec,
    Clarify,
    Plan,
    Tasks,
    Implement,
    Optimize,
    Ship,
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Spec,
        Phase::Clarify,
        Phase::Plan,
        Phase::Tasks,
        Phase::Implement,
        Phase::Optimize,
        Phase::Ship,
        Phase::Finalize,
    ];

    /// Position of this phase in the pipeline (0-based).
    pub fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|p| *p == self)
            .unwrap_or_default()
    }

    /// The phase after this one, or `None` for `Finalize`.
    pub fn next(self) -> Option<Phase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn is_first(self) -> bool {
        self == Phase::Spec
    }

    pub fn is_last(self) -> bool {
        self == Phase::Finalize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Spec => "spec",
            Phase::Clarify => "clarify",
            Phase::Plan => "plan",
            Phase::Tasks => "tasks",
            Phase::Implement => "implement",
            Phase::Optimize => "optimize",
            Phase::Ship => "ship",
            Phase::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| ParseError::UnknownPhase(s.to_string()))
    }
}

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but never resumed
    #[default]
    Pending,
    InProgress,
    Completed,
    /// A gate rejected the current phase; needs an operator retry
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::InProgress => write!(f, "in_progress"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}
