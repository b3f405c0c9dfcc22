//! Top-level driver: phase transitions, resume, rollback and retries.
//!
//! The orchestrator owns no state of its own. Every operation loads the
//! workflow document, applies one transition and saves it through the
//! [`Transactor`], so a crash between operations leaves the workflow exactly
//! where the last successful save put it. `run` is a loop over those
//! operations: execute the current phase's tasks, then try to advance.

pub mod classify;
pub mod report;

pub use classify::classify;
pub use report::{StatusReport, TaskSummary};

use serde::Serialize;
use stageflow_common::{
    GateStatus, Phase, Task, TaskDeclaration, TaskStatus, TransitionKind, Vote, VoteDecision,
    WorkflowState, WorkflowStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dag::{Batch, BatchScheduler, DependencyAnalyzer, LayerEvent, LayerExecutor, LayerSummary};
use crate::errors::{Result, StageflowError};
use crate::executor::ExecutorRegistry;
use crate::gates::{GateController, GateVerdict, Settlement};
use crate::stageflow_config::Settings;
use crate::store::{FileStateStore, StateStore, Transactor};
use crate::tracker::TaskTracker;
use crate::util::{slugify, validate_id};

/// Result of one attempt to leave the current phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Advance {
    Advanced {
        from: Phase,
        to: Phase,
        /// Phases passed over by skip rules on the way to `to`
        skipped: Vec<Phase>,
    },
    /// The workflow finished with this call
    Completed,
    /// Nothing to do: the workflow had already finished
    AlreadyCompleted,
    Blocked {
        phase: Phase,
        blockers: Vec<String>,
    },
    GatePending {
        phase: Phase,
        gate: String,
    },
    GateRejected {
        phase: Phase,
        gate: String,
        reason: String,
    },
}

impl Advance {
    /// Turn outcomes that stop the workflow into errors, for exit codes.
    pub fn into_result(self) -> Result<Advance> {
        match self {
            Advance::Blocked { phase, blockers } => {
                Err(StageflowError::TasksIncomplete { phase, blockers })
            }
            Advance::GatePending { gate, .. } => Err(StageflowError::GatePending { gate }),
            Advance::GateRejected { gate, reason, .. } => {
                Err(StageflowError::GateRejected { gate, reason })
            }
            other => Ok(other),
        }
    }

    pub fn made_progress(&self) -> bool {
        matches!(self, Advance::Advanced { .. } | Advance::Completed)
    }
}

/// Task execution carried out for one phase during a run.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseExecution {
    pub phase: Phase,
    pub summary: LayerSummary,
}

/// What [`Orchestrator::run`] did before stopping.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workflow: String,
    /// Last advance attempt; `None` when cancellation stopped the run first
    pub outcome: Option<Advance>,
    pub executed: Vec<PhaseExecution>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn into_result(self) -> Result<RunReport> {
        if let Some(outcome) = self.outcome.clone() {
            outcome.into_result()?;
        }
        Ok(self)
    }
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    txn: Arc<Transactor>,
    tracker: Arc<TaskTracker>,
    gates: GateController,
    settings: Settings,
    executors: ExecutorRegistry,
    project_dir: PathBuf,
    event_tx: Option<mpsc::Sender<LayerEvent>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn StateStore>, settings: Settings, project_dir: PathBuf) -> Result<Self> {
        let gates = settings.gate_controller()?;
        let txn = Arc::new(Transactor::new(
            Arc::clone(&store),
            settings.max_save_attempts,
        ));
        let tracker = Arc::new(TaskTracker::new(Arc::clone(&txn)));
        Ok(Self {
            store,
            txn,
            tracker,
            gates,
            settings,
            executors: ExecutorRegistry::default(),
            project_dir,
            event_tx: None,
        })
    }

    /// Orchestrator over the file store of an initialized project.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let settings = config.settings()?;
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(
            config.state_dir.clone(),
            config.archive_dir.clone(),
        ));
        Ok(Self::new(store, settings, config.project_dir.clone())?)
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<LayerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn gates(&self) -> &GateController {
        &self.gates
    }

    /// Create a workflow at the first phase.
    ///
    /// The id defaults to a slug of the description. The description is also
    /// classified into a feature profile for skip and auto-approve rules.
    pub fn start(&self, description: &str, id: Option<&str>) -> Result<WorkflowState> {
        let id = match id {
            Some(id) => {
                validate_id(id)?;
                id.to_string()
            }
            None => slugify(description)?,
        };

        let mut state = WorkflowState::new(&id, description, classify(description));
        let phase = state.phase;
        self.gates.ensure_record(&mut state, phase);
        state.record_transition(TransitionKind::Started, phase, phase, None);
        state.version = self.store.create(&state)?;

        info!(
            workflow = %id,
            research_mode = %state.profile.research_mode(),
            "Workflow started"
        );
        Ok(state)
    }

    pub fn load(&self, id: &str) -> Result<WorkflowState> {
        self.store.load(id)
    }

    /// Reload persisted state. Reads only, so repeated calls agree.
    pub fn resume(&self, id: &str) -> Result<WorkflowState> {
        let state = self.store.load(id)?;
        debug!(workflow = %id, phase = %state.phase, version = state.version, "Resumed workflow");
        Ok(state)
    }

    /// All active workflows, sorted by id.
    pub fn list(&self) -> Result<Vec<WorkflowState>> {
        self.store
            .list()?
            .iter()
            .map(|id| self.store.load(id))
            .collect()
    }

    pub fn archive(&self, id: &str) -> Result<()> {
        self.store.archive(id)?;
        self.tracker.forget(id);
        self.txn.forget(id);
        info!(workflow = %id, "Workflow archived");
        Ok(())
    }

    /// Attach the task list for the current phase.
    ///
    /// The graph is validated before anything is written, so a cycle or a
    /// dangling dependency leaves the workflow untouched.
    pub async fn declare_tasks(&self, id: &str, decls: Vec<TaskDeclaration>) -> Result<WorkflowState> {
        for decl in &decls {
            if decl.id.trim().is_empty() {
                return Err(StageflowError::InvalidTask {
                    task: decl.id.clone(),
                    message: "task id must not be empty".to_string(),
                });
            }
        }
        DependencyAnalyzer::from_declarations(&decls).build_graph()?;

        let (count, state) = self
            .txn
            .update(id, |state| {
                ensure_active(state)?;
                let phase = state.phase;
                let existing = state.phase_tasks(phase).count();
                if existing > 0 {
                    return Err(StageflowError::TasksAlreadyDeclared {
                        phase,
                        count: existing,
                    });
                }
                for decl in &decls {
                    let task = Task::from_declaration(decl.clone(), phase);
                    if let Some(executor) = self.executors.get(task.kind) {
                        executor.validate(&task)?;
                    }
                    state.tasks.push(task);
                }
                Ok(decls.len())
            })
            .await?;

        info!(workflow = %id, phase = %state.phase, count, "Tasks declared");
        Ok(state)
    }

    /// Batches for the current phase's tasks.
    pub fn batches(&self, state: &WorkflowState) -> Result<Vec<Batch>> {
        let graph = DependencyAnalyzer::from_tasks(state.current_tasks()).build_graph()?;
        Ok(BatchScheduler::new(self.settings.max_batch_size).schedule(&graph))
    }

    /// Try to leave the current phase.
    ///
    /// Evaluation that changes nothing is not written, so polling a blocked
    /// workflow does not bump its version.
    pub async fn advance(&self, id: &str) -> Result<Advance> {
        let mut probe = self.store.load(id)?;
        let before = probe.clone();
        let outcome = self.step(&mut probe)?;
        if probe == before {
            return Ok(outcome);
        }

        let (outcome, state) = self.txn.update(id, |state| self.step(state)).await?;
        match &outcome {
            Advance::Advanced { from, to, skipped } => {
                info!(workflow = %id, from = %from, to = %to, skipped = ?skipped, version = state.version, "Phase advanced")
            }
            Advance::Completed => info!(workflow = %id, version = state.version, "Workflow completed"),
            Advance::GateRejected { gate, reason, .. } => {
                warn!(workflow = %id, gate = %gate, reason = %reason, "Workflow failed at gate")
            }
            _ => debug!(workflow = %id, outcome = ?outcome, "Workflow not advanced"),
        }
        Ok(outcome)
    }

    /// One transition attempt over an in-memory state.
    fn step(&self, state: &mut WorkflowState) -> Result<Advance> {
        match state.status {
            WorkflowStatus::Completed => return Ok(Advance::AlreadyCompleted),
            WorkflowStatus::Failed => return Ok(failed_outcome(state)),
            WorkflowStatus::Pending => state.status = WorkflowStatus::InProgress,
            WorkflowStatus::InProgress => {}
        }

        let phase = state.phase;
        let tolerance = self.settings.failure_tolerance;
        let gate = self.gates.ensure_record(state, phase);
        let settlement = Settlement::compute(&state.current_tasks(), tolerance);

        if settlement.tolerance_exceeded {
            let reason = format!(
                "{} blocking task(s) failed (tolerance {}): {}",
                settlement.blocking_failures.len(),
                tolerance,
                settlement.blocking_failures.join(", ")
            );
            if let Some(record) = gate.as_ref().and_then(|name| state.gates.get_mut(name))
                && record.status == GateStatus::Pending
            {
                record.decide(GateStatus::Rejected, "rule:failure_tolerance", Some(reason.clone()));
            }
            return Ok(fail_phase(state, gate, reason));
        }
        if !settlement.is_settled() {
            return Ok(Advance::Blocked {
                phase,
                blockers: settlement.blockers,
            });
        }

        match self.gates.settle(state, phase, tolerance)? {
            GateVerdict::Approved => self.enter_next(state, phase),
            GateVerdict::Pending => Ok(Advance::GatePending {
                phase,
                gate: gate.unwrap_or_else(|| phase.to_string()),
            }),
            GateVerdict::Rejected(reason) => Ok(fail_phase(state, gate, reason)),
        }
    }

    /// Complete `from` and enter the next phase, applying skip rules.
    fn enter_next(&self, state: &mut WorkflowState, from: Phase) -> Result<Advance> {
        state.mark_phase_completed(from);
        let Some(mut next) = from.next() else {
            return Ok(complete(state, from));
        };
        state.record_transition(TransitionKind::Advanced, from, next, None);
        state.phase = next;

        let mut skipped = Vec::new();
        while let Some(condition) = self.skip_condition(state, next)? {
            state.mark_phase_completed(next);
            if !state.skipped_phases.contains(&next) {
                state.skipped_phases.push(next);
            }
            skipped.push(next);
            let Some(after) = next.next() else {
                return Ok(complete(state, next));
            };
            state.record_transition(
                TransitionKind::Skipped,
                next,
                after,
                Some(format!("skip rule '{}'", condition)),
            );
            state.phase = after;
            next = after;
        }

        self.gates.ensure_record(state, next);
        Ok(Advance::Advanced {
            from,
            to: next,
            skipped,
        })
    }

    /// Name of the skip condition that holds for `phase`, if any.
    fn skip_condition(&self, state: &WorkflowState, phase: Phase) -> Result<Option<String>> {
        if phase.is_first() {
            return Ok(None);
        }
        for rule in self.settings.skip_rules.iter().filter(|r| r.phase == phase) {
            let condition = self.gates.registry().condition(&rule.condition)?;
            if condition(state, self.gates.thresholds()) {
                return Ok(Some(rule.condition.clone()));
            }
        }
        Ok(None)
    }

    /// Drive the workflow until a gate blocks, blockers remain, it completes,
    /// or `cancel` fires.
    pub async fn run(&self, id: &str, cancel: &CancellationToken) -> Result<RunReport> {
        let mut report = RunReport {
            workflow: id.to_string(),
            outcome: None,
            executed: Vec::new(),
            cancelled: false,
        };

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let state = self.resume(id)?;
            if state.status == WorkflowStatus::Completed {
                report.outcome = Some(Advance::AlreadyCompleted);
                break;
            }
            if state.status == WorkflowStatus::Failed {
                report.outcome = Some(failed_outcome(&state));
                break;
            }

            let batches = self.batches(&state)?;
            if has_dispatchable_work(&state) {
                let summary = self.layer_executor().run(id, &batches, cancel).await?;
                let interrupted = summary.interrupted;
                report.executed.push(PhaseExecution {
                    phase: state.phase,
                    summary,
                });
                if interrupted {
                    report.cancelled = true;
                    break;
                }
            }

            let outcome = self.advance(id).await?;
            let progressed = matches!(outcome, Advance::Advanced { .. });
            report.outcome = Some(outcome);
            if !progressed {
                break;
            }
        }

        Ok(report)
    }

    fn layer_executor(&self) -> LayerExecutor {
        let executor = LayerExecutor::new(
            Arc::clone(&self.tracker),
            self.executors.clone(),
            self.project_dir.clone(),
            self.settings.task_timeout,
            self.settings.cancellation_grace,
        );
        match &self.event_tx {
            Some(tx) => executor.with_event_channel(tx.clone()),
            None => executor,
        }
    }

    /// Approve a manual gate of the current phase.
    pub async fn approve(&self, id: &str, gate: &str, approver: &str) -> Result<WorkflowState> {
        let ((), state) = self
            .txn
            .update(id, |state| {
                ensure_active(state)?;
                self.gates.approve(state, gate, approver)
            })
            .await?;
        Ok(state)
    }

    /// Reject a manual gate. The workflow fails at the current phase until
    /// the phase is retried.
    pub async fn reject(
        &self,
        id: &str,
        gate: &str,
        approver: &str,
        reason: &str,
    ) -> Result<WorkflowState> {
        let (_, state) = self
            .txn
            .update(id, |state| {
                ensure_active(state)?;
                self.gates.reject(state, gate, approver, reason)?;
                Ok(fail_phase(state, Some(gate.to_string()), reason.to_string()))
            })
            .await?;
        Ok(state)
    }

    /// Cast a vote on a vote gate. A rejecting verdict fails the workflow.
    pub async fn vote(
        &self,
        id: &str,
        gate: &str,
        voter: &str,
        decision: VoteDecision,
        weight: f64,
    ) -> Result<(GateVerdict, WorkflowState)> {
        if voter.trim().is_empty() {
            return Err(StageflowError::MissingReason {
                action: "vote without a voter name".to_string(),
            });
        }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(StageflowError::InvalidConfig(format!(
                "vote weight must be a positive number, got {}",
                weight
            )));
        }

        self.txn
            .update(id, |state| {
                ensure_active(state)?;
                let verdict = self
                    .gates
                    .vote(state, gate, Vote::new(voter, decision, weight))?;
                if let GateVerdict::Rejected(reason) = &verdict {
                    fail_phase(state, Some(gate.to_string()), reason.clone());
                }
                Ok(verdict)
            })
            .await
    }

    pub async fn waive_task(&self, id: &str, task: &str, reason: &str) -> Result<Task> {
        self.tracker.waive(id, task, reason).await
    }

    /// Reset a failed or cancelled task to pending, consuming one retry.
    pub async fn retry_task(&self, id: &str, task: &str) -> Result<Task> {
        self.tracker
            .retry(id, task, self.settings.max_task_retries)
            .await
    }

    /// Reopen the current phase after a rejection.
    ///
    /// The gate goes back to pending and failed or cancelled tasks of the
    /// phase are reset to pending, each consuming one retry. Tasks out of
    /// retries keep their status. The phase leaves `failed_phases` unless a
    /// rollback put it there.
    pub async fn retry_phase(&self, id: &str) -> Result<WorkflowState> {
        let limit = self.settings.max_task_retries;
        let ((reset, exhausted), state) = self
            .txn
            .update(id, |state| {
                let phase = state.phase;
                let gate_rejected = state
                    .gate_for_phase(phase)
                    .is_some_and(|g| g.status == GateStatus::Rejected);
                if state.status != WorkflowStatus::Failed && !gate_rejected {
                    return Err(StageflowError::NothingToRetry {
                        id: state.id.clone(),
                        phase,
                    });
                }

                self.gates.reopen(state, phase);
                state.status = WorkflowStatus::InProgress;
                let rolled_back_from = state
                    .history
                    .iter()
                    .any(|h| h.kind == TransitionKind::RolledBack && h.from == phase);
                if !rolled_back_from {
                    state.failed_phases.remove(&phase);
                }
                let outcome = reset_unsettled(state, limit, |p| p == phase);
                state.record_transition(TransitionKind::PhaseRetried, phase, phase, None);
                Ok(outcome)
            })
            .await?;

        if !exhausted.is_empty() {
            warn!(workflow = %id, tasks = ?exhausted, limit, "Tasks out of retries were not reset");
        }
        info!(workflow = %id, phase = %state.phase, reset_tasks = reset, "Phase reopened for retry");
        Ok(state)
    }

    /// Move back to an earlier phase.
    ///
    /// The phase being left is recorded in `failed_phases`. Gates from
    /// `target` onwards are reopened; completed tasks keep their evidence.
    /// Failed and cancelled tasks are reset under the same retry cap as
    /// [`Orchestrator::retry_phase`].
    pub async fn rollback(&self, id: &str, target: Phase, reason: &str) -> Result<WorkflowState> {
        if reason.trim().is_empty() {
            return Err(StageflowError::MissingReason {
                action: format!("roll back to {}", target),
            });
        }

        let limit = self.settings.max_task_retries;
        let ((from, exhausted), state) = self
            .txn
            .update(id, |state| {
                let from = state.phase;
                if target >= from {
                    return Err(StageflowError::InvalidRollback { from, to: target });
                }

                state.failed_phases.insert(from);
                state.phase = target;
                state.completed_phases.retain(|p| *p < target);
                state.skipped_phases.retain(|p| *p < target);
                for record in state.gates.values_mut().filter(|g| g.phase >= target) {
                    record.reopen();
                }
                let (_, exhausted) = reset_unsettled(state, limit, |p| p >= target);
                state.status = WorkflowStatus::InProgress;
                state.record_transition(
                    TransitionKind::RolledBack,
                    from,
                    target,
                    Some(reason.to_string()),
                );
                Ok((from, exhausted))
            })
            .await?;

        if !exhausted.is_empty() {
            warn!(workflow = %id, tasks = ?exhausted, limit, "Tasks out of retries were not reset");
        }

        warn!(workflow = %id, from = %from, to = %target, reason = %reason, "Workflow rolled back");
        Ok(state)
    }

    /// Store a named numeric input for skip conditions.
    pub async fn record_signal(&self, id: &str, name: &str, value: f64) -> Result<WorkflowState> {
        if name.trim().is_empty() {
            return Err(StageflowError::InvalidSignal {
                name: name.to_string(),
                message: "name must not be empty".to_string(),
            });
        }
        if !value.is_finite() {
            return Err(StageflowError::InvalidSignal {
                name: name.to_string(),
                message: format!("value must be a finite number, got {}", value),
            });
        }

        let ((), state) = self
            .txn
            .update(id, |state| {
                state.signals.insert(name.to_string(), value);
                Ok(())
            })
            .await?;
        debug!(workflow = %id, signal = %name, value, "Signal recorded");
        Ok(state)
    }

    /// Read-only status dump of a workflow.
    pub fn status(&self, id: &str) -> Result<StatusReport> {
        let state = self.store.load(id)?;
        StatusReport::build(&state, self)
    }
}

fn ensure_active(state: &WorkflowState) -> Result<()> {
    match state.status {
        WorkflowStatus::Completed => Err(StageflowError::WorkflowCompleted {
            id: state.id.clone(),
        }),
        WorkflowStatus::Failed => Err(StageflowError::WorkflowFailed {
            id: state.id.clone(),
            phase: state.phase,
        }),
        WorkflowStatus::Pending | WorkflowStatus::InProgress => Ok(()),
    }
}

fn has_dispatchable_work(state: &WorkflowState) -> bool {
    state
        .current_tasks()
        .iter()
        .any(|t| t.status == TaskStatus::Pending && !t.waived && t.kind.is_dispatchable())
}

fn fail_phase(state: &mut WorkflowState, gate: Option<String>, reason: String) -> Advance {
    let phase = state.phase;
    state.status = WorkflowStatus::Failed;
    state.failed_phases.insert(phase);
    state.record_transition(TransitionKind::Failed, phase, phase, Some(reason.clone()));
    Advance::GateRejected {
        phase,
        gate: gate.unwrap_or_else(|| phase.to_string()),
        reason,
    }
}

fn failed_outcome(state: &WorkflowState) -> Advance {
    let phase = state.phase;
    match state.gate_for_phase(phase) {
        Some(record) if record.status == GateStatus::Rejected => Advance::GateRejected {
            phase,
            gate: record.name.clone(),
            reason: record.reason.clone().unwrap_or_else(|| "rejected".to_string()),
        },
        _ => Advance::GateRejected {
            phase,
            gate: phase.to_string(),
            reason: state
                .history
                .iter()
                .rev()
                .find(|h| h.kind == TransitionKind::Failed)
                .and_then(|h| h.reason.clone())
                .unwrap_or_else(|| "phase failed".to_string()),
        },
    }
}

fn complete(state: &mut WorkflowState, last: Phase) -> Advance {
    state.status = WorkflowStatus::Completed;
    state.record_transition(TransitionKind::Completed, last, last, None);
    Advance::Completed
}

/// Reset failed and cancelled tasks of matching phases to pending, consuming
/// one retry each. Waived tasks keep their status, as do tasks that already
/// used `limit` retries; their ids are returned alongside the reset count.
fn reset_unsettled(
    state: &mut WorkflowState,
    limit: u32,
    in_scope: impl Fn(Phase) -> bool,
) -> (usize, Vec<String>) {
    let mut reset = 0;
    let mut exhausted = Vec::new();
    for task in state
        .tasks
        .iter_mut()
        .filter(|t| in_scope(t.phase) && !t.waived)
    {
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            continue;
        }
        if task.attempts >= limit {
            exhausted.push(task.id.clone());
            continue;
        }
        task.attempts += 1;
        task.status = TaskStatus::Pending;
        task.owner = None;
        task.updated_at = chrono::Utc::now();
        reset += 1;
    }
    (reset, exhausted)
}
