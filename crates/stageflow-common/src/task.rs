//! Tasks, their declarations, and completion evidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::phase::{ParseError, Phase};

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the executor-driven transition `self -> next` is allowed.
    ///
    /// Operator retries (failed/cancelled back to pending) are not covered
    /// here; they go through a separate, capped operation.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Pending, Cancelled)
                | (InProgress, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task gets executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Completed by an external collaborator through the CLI; never dispatched
    #[default]
    Manual,
    /// Runs `command` as a build step
    Build,
    /// Runs `command` as a test step
    Test,
    /// Writes `content` to `output`
    Content,
}

impl TaskKind {
    pub fn is_dispatchable(&self) -> bool {
        !matches!(self, TaskKind::Manual)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Manual => write!(f, "manual"),
            TaskKind::Build => write!(f, "build"),
            TaskKind::Test => write!(f, "test"),
            TaskKind::Content => write!(f, "content"),
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(TaskKind::Manual),
            "build" => Ok(TaskKind::Build),
            "test" => Ok(TaskKind::Test),
            "content" => Ok(TaskKind::Content),
            _ => Err(ParseError::UnknownTaskKind(s.to_string())),
        }
    }
}

fn default_blocking() -> bool {
    true
}

/// One entry of a task list handed to the orchestrator at phase entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDeclaration {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub kind: TaskKind,
    /// Shell command for build/test tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Body written by content tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Output path (relative to the project) for content tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Blocking tasks count against the phase failure tolerance
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

impl TaskDeclaration {
    pub fn new(id: &str, description: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            depends_on,
            kind: TaskKind::Manual,
            command: None,
            content: None,
            output: None,
            blocking: true,
        }
    }

    pub fn with_command(mut self, kind: TaskKind, command: &str) -> Self {
        self.kind = kind;
        self.command = Some(command.to_string());
        self
    }

    pub fn with_content(mut self, output: &str, content: &str) -> Self {
        self.kind = TaskKind::Content;
        self.output = Some(output.to_string());
        self.content = Some(content.to_string());
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Proof of completion supplied by an executor or operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Free-text description of what was done
    #[serde(default)]
    pub summary: String,
    /// Commands that were run
    #[serde(default)]
    pub commands: Vec<String>,
    /// Captured output (may be truncated by the producer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Files written or external references
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Evidence {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.commands.push(command.to_string());
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }

    pub fn with_artifact(mut self, artifact: &str) -> Self {
        self.artifacts.push(artifact.to_string());
        self
    }

    /// True when nothing in the evidence proves anything happened.
    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty()
            && self.commands.iter().all(|c| c.trim().is_empty())
            && self.output.as_deref().is_none_or(|o| o.trim().is_empty())
            && self.artifacts.iter().all(|a| a.trim().is_empty())
    }
}

/// An immutable, hashed evidence entry attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub summary: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Hex SHA-256 over the evidence body and commit reference
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
}

impl EvidenceRecord {
    /// Seal evidence into a record, computing its content hash.
    pub fn seal(evidence: Evidence, commit_ref: Option<String>) -> Self {
        let content_hash = Self::compute_hash(&evidence, commit_ref.as_deref());
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            summary: evidence.summary,
            commands: evidence.commands,
            output: evidence.output,
            artifacts: evidence.artifacts,
            content_hash,
            commit_ref,
        }
    }

    /// Recompute the hash from the stored fields and compare.
    pub fn verify(&self) -> bool {
        let evidence = Evidence {
            summary: self.summary.clone(),
            commands: self.commands.clone(),
            output: self.output.clone(),
            artifacts: self.artifacts.clone(),
        };
        Self::compute_hash(&evidence, self.commit_ref.as_deref()) == self.content_hash
    }

    fn compute_hash(evidence: &Evidence, commit_ref: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(evidence.summary.as_bytes());
        for command in &evidence.commands {
            hasher.update([0u8]);
            hasher.update(command.as_bytes());
        }
        hasher.update([1u8]);
        hasher.update(evidence.output.as_deref().unwrap_or("").as_bytes());
        for artifact in &evidence.artifacts {
            hasher.update([2u8]);
            hasher.update(artifact.as_bytes());
        }
        hasher.update([3u8]);
        hasher.update(commit_ref.unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A unit of execution within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub phase: Phase,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    /// Append-only completion history
    #[serde(default)]
    pub evidence: Vec<EvidenceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    #[serde(default)]
    pub waived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waive_reason: Option<String>,
    /// Number of operator retries consumed
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_declaration(decl: TaskDeclaration, phase: Phase) -> Self {
        Self {
            id: decl.id,
            description: decl.description,
            phase,
            status: TaskStatus::Pending,
            depends_on: decl.depends_on.into_iter().collect(),
            kind: decl.kind,
            command: decl.command,
            content: decl.content,
            output: decl.output,
            blocking: decl.blocking,
            evidence: Vec::new(),
            owner: None,
            commit_ref: None,
            waived: false,
            waive_reason: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether dependents of this task may run.
    pub fn satisfies_dependents(&self) -> bool {
        self.status == TaskStatus::Completed || self.waived
    }

    pub fn latest_evidence(&self) -> Option<&EvidenceRecord> {
        self.evidence.last()
    }
}
