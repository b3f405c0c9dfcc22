//! Atomic task status and evidence recording.
//!
//! Every call is one optimistic read-modify-write of the workflow document
//! through the shared [`Transactor`]. Updates to the same task are also
//! serialized in-process so their order is preserved. Tasks are addressed
//! within the workflow's current phase.

use stageflow_common::{Evidence, EvidenceRecord, Task, TaskStatus, WorkflowState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::errors::{Result, StageflowError};
use crate::store::Transactor;

/// Reason recorded on a running task that ignored cancellation.
pub const CANCELLATION_TIMEOUT: &str = "CancellationTimeout";

pub struct TaskTracker {
    txn: Arc<Transactor>,
    task_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskTracker {
    pub fn new(txn: Arc<Transactor>) -> Self {
        Self {
            txn,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    fn task_lock(&self, workflow: &str, task: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .task_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(format!("{}/{}", workflow, task)).or_default())
    }

    /// Drop the per-task locks of a workflow that left the active set.
    pub fn forget(&self, workflow: &str) {
        let prefix = format!("{}/", workflow);
        self.task_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|key, _| !key.starts_with(&prefix));
    }

    /// Apply `change` to one task of the current phase and persist it.
    async fn update_task<F>(&self, workflow: &str, task_id: &str, mut change: F) -> Result<Task>
    where
        F: FnMut(&WorkflowState, &mut Task) -> Result<()>,
    {
        let lock = self.task_lock(workflow, task_id);
        let _guard = lock.lock().await;

        let (task, _) = self
            .txn
            .update(workflow, |state| {
                let phase = state.phase;
                let index = state
                    .tasks
                    .iter()
                    .position(|t| t.phase == phase && t.id == task_id)
                    .ok_or_else(|| StageflowError::TaskNotFound {
                        id: task_id.to_string(),
                        phase,
                    })?;

                let mut task = state.tasks[index].clone();
                change(state, &mut task)?;
                task.updated_at = chrono::Utc::now();
                state.tasks[index] = task.clone();
                Ok(task)
            })
            .await?;
        Ok(task)
    }

    /// Current stored state of `workflow`, read without locking.
    pub fn snapshot(&self, workflow: &str) -> Result<WorkflowState> {
        self.txn.store().load(workflow)
    }

    pub async fn mark_in_progress(&self, workflow: &str, task_id: &str, owner: &str) -> Result<Task> {
        let task = self
            .update_task(workflow, task_id, |state, task| {
                transition(task, TaskStatus::InProgress)?;
                let waiting_on: Vec<String> = task
                    .depends_on
                    .iter()
                    .filter(|dep| {
                        !state
                            .task(task.phase, dep)
                            .is_some_and(|d| d.satisfies_dependents())
                    })
                    .cloned()
                    .collect();
                if !waiting_on.is_empty() {
                    return Err(StageflowError::DependenciesPending {
                        task: task.id.clone(),
                        waiting_on,
                    });
                }
                task.status = TaskStatus::InProgress;
                task.owner = Some(owner.to_string());
                task.last_error = None;
                Ok(())
            })
            .await?;
        info!(workflow = %workflow, task = %task_id, owner = %owner, "Task started");
        Ok(task)
    }

    /// Complete a running task, appending a sealed evidence record.
    pub async fn mark_completed(
        &self,
        workflow: &str,
        task_id: &str,
        evidence: Evidence,
        commit_ref: Option<String>,
    ) -> Result<Task> {
        let commit_ref = commit_ref.filter(|c| !c.trim().is_empty());
        if evidence.is_empty() && commit_ref.is_none() {
            return Err(StageflowError::EvidenceRequired {
                task: task_id.to_string(),
            });
        }

        let task = self
            .update_task(workflow, task_id, |_, task| {
                transition(task, TaskStatus::Completed)?;
                task.status = TaskStatus::Completed;
                task.evidence
                    .push(EvidenceRecord::seal(evidence.clone(), commit_ref.clone()));
                if commit_ref.is_some() {
                    task.commit_ref = commit_ref.clone();
                }
                Ok(())
            })
            .await?;
        info!(workflow = %workflow, task = %task_id, "Task completed");
        Ok(task)
    }

    pub async fn mark_failed(&self, workflow: &str, task_id: &str, error: &str) -> Result<Task> {
        if error.trim().is_empty() {
            return Err(StageflowError::EmptyErrorMessage {
                task: task_id.to_string(),
            });
        }

        let task = self
            .update_task(workflow, task_id, |_, task| {
                transition(task, TaskStatus::Failed)?;
                task.status = TaskStatus::Failed;
                task.last_error = Some(error.to_string());
                Ok(())
            })
            .await?;
        warn!(workflow = %workflow, task = %task_id, error = %error, "Task failed");
        Ok(task)
    }

    pub async fn mark_cancelled(&self, workflow: &str, task_id: &str, reason: &str) -> Result<Task> {
        let task = self
            .update_task(workflow, task_id, |_, task| {
                transition(task, TaskStatus::Cancelled)?;
                task.status = TaskStatus::Cancelled;
                task.last_error = Some(reason.to_string());
                Ok(())
            })
            .await?;
        info!(workflow = %workflow, task = %task_id, reason = %reason, "Task cancelled");
        Ok(task)
    }

    /// Reset a failed or cancelled task to pending, consuming one retry.
    pub async fn retry(&self, workflow: &str, task_id: &str, limit: u32) -> Result<Task> {
        let task = self
            .update_task(workflow, task_id, |_, task| {
                if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                    return Err(StageflowError::InvalidTransition {
                        task: task.id.clone(),
                        from: task.status,
                        to: TaskStatus::Pending,
                    });
                }
                if task.attempts >= limit {
                    return Err(StageflowError::RetryLimitExceeded {
                        task: task.id.clone(),
                        limit,
                    });
                }
                task.attempts += 1;
                task.status = TaskStatus::Pending;
                task.owner = None;
                task.waived = false;
                task.waive_reason = None;
                Ok(())
            })
            .await?;
        info!(workflow = %workflow, task = %task_id, attempts = task.attempts, "Task reset for retry");
        Ok(task)
    }

    /// Mark a task as not required for the phase to settle.
    pub async fn waive(&self, workflow: &str, task_id: &str, reason: &str) -> Result<Task> {
        if reason.trim().is_empty() {
            return Err(StageflowError::MissingReason {
                action: format!("waive task '{}'", task_id),
            });
        }

        let task = self
            .update_task(workflow, task_id, |_, task| {
                if matches!(task.status, TaskStatus::Completed | TaskStatus::InProgress) {
                    return Err(StageflowError::InvalidTask {
                        task: task.id.clone(),
                        message: format!("cannot waive a task that is {}", task.status),
                    });
                }
                task.waived = true;
                task.waive_reason = Some(reason.to_string());
                Ok(())
            })
            .await?;
        info!(workflow = %workflow, task = %task_id, reason = %reason, "Task waived");
        Ok(task)
    }
}

fn transition(task: &Task, to: TaskStatus) -> Result<()> {
    if task.waived {
        return Err(StageflowError::InvalidTask {
            task: task.id.clone(),
            message: "task is waived".to_string(),
        });
    }
    if !task.status.can_transition_to(to) {
        return Err(StageflowError::InvalidTransition {
            task: task.id.clone(),
            from: task.status,
            to,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStateStore, InMemoryStateStore, StateStore};
    use stageflow_common::{FeatureProfile, Phase, TaskDeclaration};
    use tempfile::tempdir;

    fn seeded_state(task_ids: &[(&str, Vec<&str>)]) -> WorkflowState {
        let mut state = WorkflowState::new("wf", "", FeatureProfile::default());
        state.phase = Phase::Implement;
        for (id, deps) in task_ids {
            let decl = TaskDeclaration::new(id, id, deps.iter().map(|d| d.to_string()).collect());
            state.tasks.push(Task::from_declaration(decl, Phase::Implement));
        }
        state
    }

    fn make_tracker(state: WorkflowState) -> (Arc<InMemoryStateStore>, TaskTracker) {
        let store = Arc::new(InMemoryStateStore::new());
        store.create(&state).unwrap();
        let txn = Arc::new(Transactor::new(store.clone(), 5));
        (store, TaskTracker::new(txn))
    }

    #[tokio::test]
    async fn test_full_lifecycle_records_evidence() {
        let (store, tracker) = make_tracker(seeded_state(&[("T1", vec![])]));

        tracker.mark_in_progress("wf", "T1", "worker-1").await.unwrap();
        let task = tracker
            .mark_completed(
                "wf",
                "T1",
                Evidence::new("built").with_command("cargo build"),
                Some("abc123".into()),
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.evidence.len(), 1);
        assert!(task.evidence[0].verify());
        assert_eq!(task.commit_ref.as_deref(), Some("abc123"));

        let stored = store.load("wf").unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_forget_drops_task_locks() {
        let (_store, tracker) = make_tracker(seeded_state(&[("T1", vec![]), ("T2", vec![])]));
        tracker.mark_in_progress("wf", "T1", "w").await.unwrap();
        tracker.mark_in_progress("wf", "T2", "w").await.unwrap();
        tracker.task_lock("wf-2", "T1");
        assert_eq!(tracker.task_locks.lock().unwrap().len(), 3);

        tracker.forget("wf");
        let locks = tracker.task_locks.lock().unwrap();
        assert_eq!(locks.keys().collect::<Vec<_>>(), vec!["wf-2/T1"]);
    }

    #[tokio::test]
    async fn test_pending_cannot_complete() {
        let (_store, tracker) = make_tracker(seeded_state(&[("T1", vec![])]));
        let err = tracker
            .mark_completed("wf", "T1", Evidence::new("done"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageflowError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_completion_requires_evidence() {
        let (_store, tracker) = make_tracker(seeded_state(&[("T1", vec![])]));
        tracker.mark_in_progress("wf", "T1", "me").await.unwrap();
        let err = tracker
            .mark_completed("wf", "T1", Evidence::default(), Some("  ".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StageflowError::EvidenceRequired { .. }));

        // A commit reference alone is enough
        tracker
            .mark_completed("wf", "T1", Evidence::default(), Some("deadbeef".into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_requires_message() {
        let (_store, tracker) = make_tracker(seeded_state(&[("T1", vec![])]));
        tracker.mark_in_progress("wf", "T1", "me").await.unwrap();
        assert!(matches!(
            tracker.mark_failed("wf", "T1", "").await,
            Err(StageflowError::EmptyErrorMessage { .. })
        ));
        let task = tracker.mark_failed("wf", "T1", "exit 2").await.unwrap();
        assert_eq!(task.last_error.as_deref(), Some("exit 2"));
    }

    #[tokio::test]
    async fn test_start_waits_for_dependencies() {
        let (_store, tracker) =
            make_tracker(seeded_state(&[("T1", vec![]), ("T2", vec!["T1"])]));
        let err = tracker.mark_in_progress("wf", "T2", "me").await.unwrap_err();
        match err {
            StageflowError::DependenciesPending { waiting_on, .. } => {
                assert_eq!(waiting_on, vec!["T1".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }

        tracker.mark_in_progress("wf", "T1", "me").await.unwrap();
        tracker.mark_failed("wf", "T1", "broken").await.unwrap();
        tracker.waive("wf", "T1", "covered elsewhere").await.unwrap();
        tracker.mark_in_progress("wf", "T2", "me").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_and_retry_cap() {
        let (_store, tracker) = make_tracker(seeded_state(&[("T1", vec![])]));
        tracker.mark_cancelled("wf", "T1", "operator").await.unwrap();

        let task = tracker.retry("wf", "T1", 1).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);

        tracker.mark_in_progress("wf", "T1", "me").await.unwrap();
        tracker.mark_failed("wf", "T1", "again").await.unwrap();
        assert!(matches!(
            tracker.retry("wf", "T1", 1).await,
            Err(StageflowError::RetryLimitExceeded { limit: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_only_from_failed_or_cancelled() {
        let (_store, tracker) = make_tracker(seeded_state(&[("T1", vec![])]));
        assert!(matches!(
            tracker.retry("wf", "T1", 3).await,
            Err(StageflowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_evidence_is_append_only_across_retries() {
        let (_store, tracker) = make_tracker(seeded_state(&[("T1", vec![])]));
        tracker.mark_in_progress("wf", "T1", "me").await.unwrap();
        tracker
            .mark_completed("wf", "T1", Evidence::new("first"), None)
            .await
            .unwrap();
        // Completed tasks cannot be reopened through the tracker
        assert!(tracker.mark_in_progress("wf", "T1", "me").await.is_err());
        assert!(tracker.mark_cancelled("wf", "T1", "late").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let (_store, tracker) = make_tracker(seeded_state(&[]));
        assert!(matches!(
            tracker.mark_in_progress("wf", "ghost", "me").await,
            Err(StageflowError::TaskNotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completions_lose_no_updates() {
        const N: usize = 16;
        let dir = tempdir().unwrap();
        let ids: Vec<String> = (0..N).map(|i| format!("T{:02}", i)).collect();
        let state = seeded_state(&ids.iter().map(|id| (id.as_str(), vec![])).collect::<Vec<_>>());

        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(
            dir.path().join("state"),
            dir.path().join("archive"),
        ));
        store.create(&state).unwrap();

        // Two trackers with separate transactors behave like two processes
        // racing on the same document.
        let trackers: Vec<Arc<TaskTracker>> = (0..2)
            .map(|_| Arc::new(TaskTracker::new(Arc::new(Transactor::new(store.clone(), 50)))))
            .collect();

        let mut handles = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let tracker = Arc::clone(&trackers[i % 2]);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                tracker.mark_in_progress("wf", &id, "w").await?;
                tracker
                    .mark_completed("wf", &id, Evidence::new(&format!("done {}", id)), None)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.load("wf").unwrap();
        assert!(stored.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert!(stored.tasks.iter().all(|t| t.evidence.len() == 1));
        assert_eq!(stored.version, 1 + 2 * N as u64);
    }
}
