//! Typed error hierarchy for the stageflow orchestrator.
//!
//! One enum covers every subsystem so the CLI can map any failure to an exit
//! code. Variants are grouped by [`ErrorKind`]:
//! - `Validation`: malformed input or an illegal transition; never retried
//! - `Conflict`: optimistic version mismatch; retried by callers
//! - `Contention`: conflicts persisted past the retry bound
//! - `Gate`: a phase gate is pending or rejected
//! - `Storage`: the state directory could not be read or written

use stageflow_common::{GateStatus, ParseError, Phase, TaskStatus};
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification used for retry decisions and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Contention,
    Gate,
    Storage,
    Internal,
}

#[derive(Debug, Error)]
pub enum StageflowError {
    #[error("Workflow '{id}' not found")]
    NotFound { id: String },

    #[error("Workflow '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("Version conflict on workflow '{id}': expected version {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Contention exceeded on workflow '{id}' after {attempts} attempts")]
    ContentionExceeded { id: String, attempts: u32 },

    #[error("Malformed state document at {path}: {source}")]
    MalformedState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    DanglingDependency { task: String, dependency: String },

    #[error("Duplicate task id '{id}'")]
    DuplicateTask { id: String },

    #[error("Cycle detected in task dependencies: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Task '{id}' not found in phase {phase}")]
    TaskNotFound { id: String, phase: Phase },

    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task '{task}' is waiting on unfinished dependencies: {}", waiting_on.join(", "))]
    DependenciesPending {
        task: String,
        waiting_on: Vec<String>,
    },

    #[error("Task '{task}' cannot be marked completed without evidence")]
    EvidenceRequired { task: String },

    #[error("Task '{task}' cannot be marked failed without an error message")]
    EmptyErrorMessage { task: String },

    #[error("Task '{task}' has used all {limit} retries")]
    RetryLimitExceeded { task: String, limit: u32 },

    #[error("Phase {phase} already has {count} declared task(s)")]
    TasksAlreadyDeclared { phase: Phase, count: usize },

    #[error("Phase {phase} has unsettled tasks: {}", blockers.join(", "))]
    TasksIncomplete { phase: Phase, blockers: Vec<String> },

    #[error("Gate '{gate}' is pending")]
    GatePending { gate: String },

    #[error("Gate '{gate}' was rejected: {reason}")]
    GateRejected { gate: String, reason: String },

    #[error("Gate '{gate}' is already {status}")]
    GateAlreadyDecided { gate: String, status: GateStatus },

    #[error("Unknown gate '{gate}' on workflow '{id}'")]
    UnknownGate { id: String, gate: String },

    #[error("Gate '{gate}' belongs to phase {gate_phase}; workflow is at {current}")]
    GateNotActive {
        gate: String,
        gate_phase: Phase,
        current: Phase,
    },

    #[error("Gate '{gate}' does not accept {action}")]
    WrongGateKind { gate: String, action: String },

    #[error("Unknown predicate '{name}'")]
    UnknownPredicate { name: String },

    #[error("Cannot roll back from {from} to {to}: target must be an earlier phase")]
    InvalidRollback { from: Phase, to: Phase },

    #[error("Workflow '{id}' is already completed")]
    WorkflowCompleted { id: String },

    #[error("Workflow '{id}' has failed at phase {phase}; retry the phase first")]
    WorkflowFailed { id: String, phase: Phase },

    #[error("Phase {phase} of workflow '{id}' has not failed; nothing to retry")]
    NothingToRetry { id: String, phase: Phase },

    #[error("Invalid signal '{name}': {message}")]
    InvalidSignal { name: String, message: String },

    #[error("A reason is required to {action}")]
    MissingReason { action: String },

    #[error("Invalid workflow id '{0}'")]
    InvalidSlug(String),

    #[error("Invalid task '{task}': {message}")]
    InvalidTask { task: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = StageflowError> = std::result::Result<T, E>;

impl StageflowError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        use StageflowError::*;
        match self {
            VersionConflict { .. } => ErrorKind::Conflict,
            ContentionExceeded { .. } => ErrorKind::Contention,
            GatePending { .. } | GateRejected { .. } => ErrorKind::Gate,
            Io { .. } => ErrorKind::Storage,
            Other(_) => ErrorKind::Internal,
            NotFound { .. }
            | AlreadyExists { .. }
            | MalformedState { .. }
            | DanglingDependency { .. }
            | DuplicateTask { .. }
            | CycleDetected { .. }
            | TaskNotFound { .. }
            | InvalidTransition { .. }
            | DependenciesPending { .. }
            | EvidenceRequired { .. }
            | EmptyErrorMessage { .. }
            | RetryLimitExceeded { .. }
            | TasksAlreadyDeclared { .. }
            | TasksIncomplete { .. }
            | GateAlreadyDecided { .. }
            | UnknownGate { .. }
            | GateNotActive { .. }
            | WrongGateKind { .. }
            | UnknownPredicate { .. }
            | InvalidRollback { .. }
            | WorkflowCompleted { .. }
            | WorkflowFailed { .. }
            | NothingToRetry { .. }
            | InvalidSignal { .. }
            | MissingReason { .. }
            | InvalidSlug(_)
            | InvalidTask { .. }
            | InvalidConfig(_)
            | Parse(_) => ErrorKind::Validation,
        }
    }

    /// Process exit code: 1 validation, 2 gate, 3 contention.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Gate => 2,
            ErrorKind::Contention | ErrorKind::Conflict => 3,
            ErrorKind::Validation | ErrorKind::Storage | ErrorKind::Internal => 1,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}
