//! Shared domain types for the stageflow orchestrator.
//!
//! Everything in this crate is plain data: the persisted workflow document,
//! its tasks, gates and evidence records. Behaviour that needs storage,
//! scheduling or I/O lives in the `stageflow` crate.

pub mod gate;
pub mod phase;
pub mod state;
pub mod task;

pub use gate::{GateKind, GateRecord, GateStatus, Vote, VoteDecision};
pub use phase::{ParseError, Phase, WorkflowStatus};
pub use state::{
    FeatureProfile, ResearchMode, TransitionKind, TransitionRecord, WorkflowState,
};
pub use task::{Evidence, EvidenceRecord, Task, TaskDeclaration, TaskKind, TaskStatus};
