//! Batch execution with a barrier between batches.
//!
//! Each batch is spawned on a [`JoinSet`] and awaited in full before the next
//! one starts. State is re-read between batches, so a task is dispatched only
//! if it is still pending and every dependency is completed or waived at that
//! moment. All status changes go through the [`TaskTracker`].

use serde::Serialize;
use stageflow_common::{Task, TaskStatus, WorkflowState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::scheduler::Batch;
use crate::errors::{Result, StageflowError};
use crate::executor::{ExecutionContext, ExecutionOutcome, ExecutorRegistry, TaskExecutor};
use crate::tracker::{CANCELLATION_TIMEOUT, TaskTracker};

/// Reason recorded on tasks that never started because the run was cancelled.
pub const RUN_CANCELLED: &str = "run cancelled before the task started";

/// Progress notifications for observers such as the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerEvent {
    BatchStarted { index: usize, tasks: Vec<String> },
    TaskFinished { task: String, status: TaskStatus },
    BatchFinished { index: usize },
}

/// What one call to [`LayerExecutor::run`] did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayerSummary {
    pub batches_run: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub cancelled: Vec<String>,
    /// Tasks left alone: manual, waived, already settled, or still blocked
    pub skipped: Vec<String>,
    /// The run stopped early because cancellation was requested
    pub interrupted: bool,
}

impl LayerSummary {
    pub fn dispatched(&self) -> usize {
        self.completed.len() + self.failed.len() + self.cancelled.len()
    }

    fn record(&mut self, task: String, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed.push(task),
            TaskStatus::Failed => self.failed.push(task),
            TaskStatus::Cancelled => self.cancelled.push(task),
            TaskStatus::Pending | TaskStatus::InProgress => self.skipped.push(task),
        }
    }
}

pub struct LayerExecutor {
    tracker: Arc<TaskTracker>,
    executors: ExecutorRegistry,
    project_dir: PathBuf,
    task_timeout: Duration,
    cancellation_grace: Duration,
    owner: String,
    event_tx: Option<mpsc::Sender<LayerEvent>>,
}

impl LayerExecutor {
    pub fn new(
        tracker: Arc<TaskTracker>,
        executors: ExecutorRegistry,
        project_dir: PathBuf,
        task_timeout: Duration,
        cancellation_grace: Duration,
    ) -> Self {
        Self {
            tracker,
            executors,
            project_dir,
            task_timeout,
            cancellation_grace,
            owner: format!("stageflow@{}", std::process::id()),
            event_tx: None,
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<LayerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    async fn emit(&self, event: LayerEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }

    /// Run `batches` of the workflow's current phase in order.
    ///
    /// Returns once every batch has run or cancellation was observed at a
    /// batch boundary. A tracker error stops dispatch, but tasks already
    /// started in the batch run to completion before the error is returned.
    pub async fn run(
        &self,
        workflow: &str,
        batches: &[Batch],
        cancel: &CancellationToken,
    ) -> Result<LayerSummary> {
        let mut summary = LayerSummary::default();

        for (index, batch) in batches.iter().enumerate() {
            let state = self.tracker.snapshot(workflow)?;

            if cancel.is_cancelled() {
                info!(workflow = %workflow, batch = index, "Run cancelled; cancelling tasks not yet started");
                self.cancel_unstarted(&state, &batches[index..], &mut summary)
                    .await?;
                summary.interrupted = true;
                break;
            }

            let (dispatch, dispatch_error) = self
                .start_batch(&state, index, batch, cancel, &mut summary)
                .await;
            let drained = if dispatch.is_empty() {
                Ok(())
            } else {
                summary.batches_run += 1;
                let drained = self.drain(workflow, dispatch, &mut summary).await;
                self.emit(LayerEvent::BatchFinished { index }).await;
                drained
            };
            if let Some(e) = dispatch_error {
                return Err(e);
            }
            drained?;
        }

        if !summary.interrupted && cancel.is_cancelled() {
            summary.interrupted = true;
        }
        Ok(summary)
    }

    /// Mark eligible tasks in progress and spawn them.
    ///
    /// A tracker error stops further dispatch and is handed back next to the
    /// tasks already spawned, so the caller can drain them first.
    async fn start_batch(
        &self,
        state: &WorkflowState,
        index: usize,
        batch: &Batch,
        cancel: &CancellationToken,
        summary: &mut LayerSummary,
    ) -> (JoinSet<Result<(String, TaskStatus)>>, Option<StageflowError>) {
        let workflow = state.id.as_str();
        let mut set = JoinSet::new();
        let mut started = Vec::new();
        let mut dispatch_error = None;

        for id in &batch.tasks {
            let Some(task) = state.task(state.phase, id) else {
                continue;
            };
            let executor = match self.eligible(state, task) {
                Some(executor) => executor,
                None => {
                    debug!(workflow = %workflow, task = %id, status = %task.status, "Task not dispatchable");
                    summary.skipped.push(id.clone());
                    continue;
                }
            };

            if let Err(e) = executor.validate(task) {
                warn!(workflow = %workflow, task = %id, error = %e, "Task failed validation");
                let recorded = match self.tracker.mark_in_progress(workflow, id, &self.owner).await {
                    Ok(_) => self.tracker.mark_failed(workflow, id, &e.to_string()).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = recorded {
                    warn!(workflow = %workflow, task = %id, error = %e, "Failed to record validation failure; stopping dispatch");
                    dispatch_error = Some(e);
                    break;
                }
                summary.failed.push(id.clone());
                continue;
            }

            match self.tracker.mark_in_progress(workflow, id, &self.owner).await {
                Ok(_) => {}
                // Another writer moved the task or a dependency since the snapshot
                Err(e @ (StageflowError::DependenciesPending { .. }
                | StageflowError::InvalidTransition { .. }
                | StageflowError::InvalidTask { .. })) => {
                    debug!(workflow = %workflow, task = %id, error = %e, "Task no longer dispatchable");
                    summary.skipped.push(id.clone());
                    continue;
                }
                Err(e) => {
                    warn!(workflow = %workflow, task = %id, error = %e, "Failed to start task; stopping dispatch");
                    dispatch_error = Some(e);
                    break;
                }
            }

            let ctx = ExecutionContext {
                workflow: workflow.to_string(),
                phase: state.phase,
                project_dir: self.project_dir.clone(),
                timeout: self.task_timeout,
                cancel: cancel.child_token(),
            };
            set.spawn(run_task(
                Arc::clone(&self.tracker),
                executor,
                task.clone(),
                ctx,
                self.cancellation_grace,
            ));
            started.push(id.clone());
        }

        if !started.is_empty() {
            info!(workflow = %workflow, batch = index, tasks = ?started, "Batch started");
            self.emit(LayerEvent::BatchStarted {
                index,
                tasks: started,
            })
            .await;
        }
        (set, dispatch_error)
    }

    /// Barrier: wait for every spawned task to reach a terminal state.
    async fn drain(
        &self,
        workflow: &str,
        mut set: JoinSet<Result<(String, TaskStatus)>>,
        summary: &mut LayerSummary,
    ) -> Result<()> {
        let mut first_error = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok((task, status))) => {
                    self.emit(LayerEvent::TaskFinished {
                        task: task.clone(),
                        status,
                    })
                    .await;
                    summary.record(task, status);
                }
                Ok(Err(e)) => {
                    warn!(workflow = %workflow, error = %e, "Failed to record task outcome");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(workflow = %workflow, error = %e, "Task runner did not finish");
                    first_error.get_or_insert(StageflowError::Other(anyhow::anyhow!(
                        "task runner panicked: {}",
                        e
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn eligible(&self, state: &WorkflowState, task: &Task) -> Option<Arc<dyn TaskExecutor>> {
        if task.status != TaskStatus::Pending || task.waived || !task.kind.is_dispatchable() {
            return None;
        }
        let ready = task.depends_on.iter().all(|dep| {
            state
                .task(task.phase, dep)
                .is_some_and(|d| d.satisfies_dependents())
        });
        if !ready {
            return None;
        }
        self.executors.get(task.kind)
    }

    async fn cancel_unstarted(
        &self,
        state: &WorkflowState,
        batches: &[Batch],
        summary: &mut LayerSummary,
    ) -> Result<()> {
        for id in batches.iter().flat_map(|b| b.tasks.iter()) {
            let Some(task) = state.task(state.phase, id) else {
                continue;
            };
            if task.status != TaskStatus::Pending || task.waived || !task.kind.is_dispatchable() {
                continue;
            }
            self.tracker
                .mark_cancelled(&state.id, id, RUN_CANCELLED)
                .await?;
            summary.cancelled.push(id.clone());
        }
        Ok(())
    }
}

/// Execute one task and record its outcome.
///
/// Once cancellation fires the executor has `grace` to stop on its own. After
/// that its future is dropped and the task is failed with
/// [`CANCELLATION_TIMEOUT`].
async fn run_task(
    tracker: Arc<TaskTracker>,
    executor: Arc<dyn TaskExecutor>,
    task: Task,
    ctx: ExecutionContext,
    grace: Duration,
) -> Result<(String, TaskStatus)> {
    let workflow = ctx.workflow.clone();
    let cancel = ctx.cancel.clone();
    let deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    let outcome = tokio::select! {
        outcome = executor.execute(&task, &ctx) => outcome,
        _ = deadline => {
            warn!(workflow = %workflow, task = %task.id, grace_ms = grace.as_millis() as u64, "Task ignored cancellation; aborting");
            tracker.mark_failed(&workflow, &task.id, CANCELLATION_TIMEOUT).await?;
            return Ok((task.id.clone(), TaskStatus::Failed));
        }
    };

    let status = match outcome {
        ExecutionOutcome::Succeeded(evidence) => {
            tracker
                .mark_completed(&workflow, &task.id, evidence, None)
                .await?
                .status
        }
        ExecutionOutcome::Failed(error) => {
            let error = if error.trim().is_empty() {
                format!("{} executor failed", executor.name())
            } else {
                error
            };
            tracker.mark_failed(&workflow, &task.id, &error).await?.status
        }
        ExecutionOutcome::Cancelled => {
            tracker
                .mark_cancelled(&workflow, &task.id, "stopped on cancellation")
                .await?
                .status
        }
    };
    Ok((task.id, status))
}
