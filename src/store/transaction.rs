//! Bounded read-modify-write over a [`StateStore`].

use stageflow_common::WorkflowState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::StateStore;
use crate::errors::{Result, StageflowError};

/// Runs mutations as optimistic transactions.
///
/// Writers in this process are serialized per workflow, so version conflicts
/// only arise against other processes. Those are retried with a short,
/// growing backoff until `max_attempts` is used up.
pub struct Transactor {
    store: Arc<dyn StateStore>,
    max_attempts: u32,
    workflow_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Transactor {
    pub fn new(store: Arc<dyn StateStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            workflow_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn workflow_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .workflow_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Drop the in-process lock of a workflow that left the active set.
    pub fn forget(&self, id: &str) {
        self.workflow_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }

    /// Load `id`, apply `mutate`, and save against the loaded version.
    ///
    /// `mutate` may run several times and must derive everything from the
    /// state it is handed. An error from `mutate` aborts without saving.
    /// Returns the closure's value and the state as stored.
    pub async fn update<T, F>(&self, id: &str, mut mutate: F) -> Result<(T, WorkflowState)>
    where
        F: FnMut(&mut WorkflowState) -> Result<T>,
    {
        let lock = self.workflow_lock(id);
        let _guard = lock.lock().await;

        for attempt in 1..=self.max_attempts {
            let mut state = self.store.load(id)?;
            let expected = state.version;
            let value = mutate(&mut state)?;
            state.touch();

            match self.store.save(&state, expected) {
                Ok(version) => {
                    state.version = version;
                    return Ok((value, state));
                }
                Err(e) if e.is_conflict() => {
                    debug!(workflow = %id, attempt, error = %e, "Retrying after version conflict");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(workflow = %id, attempts = self.max_attempts, "Contention exceeded");
        Err(StageflowError::ContentionExceeded {
            id: id.to_string(),
            attempts: self.max_attempts,
        })
    }
}

fn backoff(attempt: u32) -> Duration {
    let jitter = u64::from(chrono::Utc::now().timestamp_subsec_micros() % 5);
    Duration::from_millis(u64::from(attempt) * 5 + jitter)
}
