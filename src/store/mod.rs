//! Durable storage for workflow documents.
//!
//! Every write is an optimistic transaction: the caller names the version it
//! read, and the save fails with `VersionConflict` if someone else got there
//! first. On success the stored version is `expected + 1`.

mod file;
mod memory;
mod transaction;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;
pub use transaction::Transactor;

use stageflow_common::WorkflowState;

use crate::errors::Result;

pub trait StateStore: Send + Sync {
    /// Persist a brand-new workflow at version 1.
    fn create(&self, state: &WorkflowState) -> Result<u64>;

    fn load(&self, id: &str) -> Result<WorkflowState>;

    /// Replace the stored document if its version still equals
    /// `expected_version`. Returns the new version.
    fn save(&self, state: &WorkflowState, expected_version: u64) -> Result<u64>;

    fn exists(&self, id: &str) -> bool;

    /// Ids of all active (non-archived) workflows, sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// Move the workflow out of the active set. Archived workflows are kept,
    /// never deleted.
    fn archive(&self, id: &str) -> Result<()>;
}

/// Stamp `state` as the document stored at `version`.
pub(crate) fn stamped(state: &WorkflowState, version: u64) -> WorkflowState {
    let mut next = state.clone();
    next.version = version;
    next.touch();
    next
}
