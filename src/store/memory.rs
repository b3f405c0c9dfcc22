//! In-memory state store for tests and dry runs.

use stageflow_common::WorkflowState;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{StateStore, stamped};
use crate::errors::{Result, StageflowError};

#[derive(Default)]
pub struct InMemoryStateStore {
    active: Mutex<BTreeMap<String, WorkflowState>>,
    archived: Mutex<Vec<WorkflowState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived(&self) -> Vec<WorkflowState> {
        relock(&self.archived).clone()
    }
}

/// A panicked writer cannot leave a half-written document behind (each
/// entry is replaced whole), so poisoning is safe to ignore.
fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StateStore for InMemoryStateStore {
    fn create(&self, state: &WorkflowState) -> Result<u64> {
        let mut active = relock(&self.active);
        if active.contains_key(&state.id) {
            return Err(StageflowError::AlreadyExists {
                id: state.id.clone(),
            });
        }
        active.insert(state.id.clone(), stamped(state, 1));
        Ok(1)
    }

    fn load(&self, id: &str) -> Result<WorkflowState> {
        relock(&self.active)
            .get(id)
            .cloned()
            .ok_or_else(|| StageflowError::NotFound { id: id.to_string() })
    }

    fn save(&self, state: &WorkflowState, expected_version: u64) -> Result<u64> {
        let mut active = relock(&self.active);
        let current = active
            .get(&state.id)
            .ok_or_else(|| StageflowError::NotFound {
                id: state.id.clone(),
            })?;
        if current.version != expected_version {
            return Err(StageflowError::VersionConflict {
                id: state.id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        let version = expected_version + 1;
        active.insert(state.id.clone(), stamped(state, version));
        Ok(version)
    }

    fn exists(&self, id: &str) -> bool {
        relock(&self.active).contains_key(id)
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(relock(&self.active).keys().cloned().collect())
    }

    fn archive(&self, id: &str) -> Result<()> {
        let state = relock(&self.active)
            .remove(id)
            .ok_or_else(|| StageflowError::NotFound { id: id.to_string() })?;
        relock(&self.archived).push(state);
        Ok(())
    }
}
