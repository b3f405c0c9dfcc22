//! Gate records: persisted approval checkpoints between phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::{ParseError, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl GateStatus {
    /// Approved and rejected are terminal until a phase retry reopens the gate.
    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Pending => write!(f, "pending"),
            GateStatus::Approved => write!(f, "approved"),
            GateStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// How a gate reaches its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// Pure predicate over the phase output
    #[default]
    Automated,
    /// External approve/reject signal
    Manual,
    /// Aggregated reviewer votes
    Vote,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateKind::Automated => write!(f, "automated"),
            GateKind::Manual => write!(f, "manual"),
            GateKind::Vote => write!(f, "vote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
    Abstain,
}

impl std::str::FromStr for VoteDecision {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(VoteDecision::Approve),
            "reject" => Ok(VoteDecision::Reject),
            "abstain" => Ok(VoteDecision::Abstain),
            _ => Err(ParseError::UnknownVote(s.to_string())),
        }
    }
}

/// A single reviewer vote on a vote gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: String,
    pub decision: VoteDecision,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub cast_at: DateTime<Utc>,
}

fn default_weight() -> f64 {
    1.0
}

impl Vote {
    pub fn new(voter: &str, decision: VoteDecision, weight: f64) -> Self {
        Self {
            voter: voter.to_string(),
            decision,
            weight,
            cast_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub name: String,
    pub phase: Phase,
    #[serde(default)]
    pub kind: GateKind,
    #[serde(default)]
    pub status: GateStatus,
    /// When the gate was last decided or reopened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Human identity or `rule:<predicate>` for automated decisions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub votes: Vec<Vote>,
}

impl GateRecord {
    pub fn new(name: &str, phase: Phase, kind: GateKind) -> Self {
        Self {
            name: name.to_string(),
            phase,
            kind,
            status: GateStatus::Pending,
            timestamp: None,
            approver: None,
            reason: None,
            votes: Vec::new(),
        }
    }

    pub fn decide(&mut self, status: GateStatus, approver: &str, reason: Option<String>) {
        self.status = status;
        self.approver = Some(approver.to_string());
        self.reason = reason;
        self.timestamp = Some(Utc::now());
    }

    /// Clear the decision and any votes so the gate can be evaluated again.
    pub fn reopen(&mut self) {
        self.status = GateStatus::Pending;
        self.approver = None;
        self.reason = None;
        self.votes.clear();
        self.timestamp = Some(Utc::now());
    }
}
