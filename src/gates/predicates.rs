//! Named predicates used by gates and skip rules.
//!
//! Two families live here:
//! - gate predicates judge a phase's task output and return a [`GateVerdict`]
//! - conditions are boolean tests over the workflow (skip a phase,
//!   auto-approve a manual gate)
//!
//! Both are looked up by name so that policy stays in configuration.

use stageflow_common::{Phase, Task, TaskStatus, WorkflowState};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{Result, StageflowError};

/// Outcome of evaluating a gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Approved,
    Rejected(String),
    Pending,
}

impl GateVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, GateVerdict::Approved)
    }
}

/// Numeric thresholds that conditions compare against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// `low_ambiguity` holds when the `ambiguity` signal is below this
    pub clarify_ambiguity: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            clarify_ambiguity: 3.0,
        }
    }
}

/// How the tasks of one phase have settled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settlement {
    /// Tasks that still prevent the phase from advancing, rendered for humans
    pub blockers: Vec<String>,
    /// Failed blocking tasks that are not waived
    pub blocking_failures: Vec<String>,
    /// Failed non-blocking tasks (reported, never gating)
    pub tolerated_failures: Vec<String>,
    pub tolerance_exceeded: bool,
}

impl Settlement {
    pub fn compute(tasks: &[&Task], failure_tolerance: usize) -> Self {
        let mut settlement = Settlement::default();
        let mut pending = Vec::new();

        for task in tasks {
            if task.waived || task.status == TaskStatus::Completed {
                continue;
            }
            match task.status {
                TaskStatus::Failed if task.blocking => {
                    settlement.blocking_failures.push(describe_failure(task));
                }
                TaskStatus::Failed => settlement.tolerated_failures.push(describe_failure(task)),
                status => pending.push(format!("{} ({})", task.id, status)),
            }
        }

        settlement.tolerance_exceeded = settlement.blocking_failures.len() > failure_tolerance;
        if settlement.tolerance_exceeded {
            settlement
                .blockers
                .extend(settlement.blocking_failures.iter().cloned());
        }
        settlement.blockers.extend(pending);
        settlement
    }

    pub fn is_settled(&self) -> bool {
        self.blockers.is_empty()
    }
}

fn describe_failure(task: &Task) -> String {
    match task.last_error.as_deref() {
        Some(err) => format!("{} (failed: {})", task.id, err),
        None => format!("{} (failed)", task.id),
    }
}

/// Everything a gate predicate may look at.
pub struct PhaseContext<'a> {
    pub state: &'a WorkflowState,
    pub phase: Phase,
    pub tasks: Vec<&'a Task>,
    pub failure_tolerance: usize,
}

impl<'a> PhaseContext<'a> {
    pub fn new(state: &'a WorkflowState, phase: Phase, failure_tolerance: usize) -> Self {
        Self {
            state,
            phase,
            tasks: state.phase_tasks(phase).collect(),
            failure_tolerance,
        }
    }

    pub fn settlement(&self) -> Settlement {
        Settlement::compute(&self.tasks, self.failure_tolerance)
    }
}

pub type GatePredicate = Arc<dyn Fn(&PhaseContext<'_>) -> GateVerdict + Send + Sync>;
pub type Condition = Arc<dyn Fn(&WorkflowState, &Thresholds) -> bool + Send + Sync>;

/// Registry of gate predicates and conditions, keyed by name.
#[derive(Clone)]
pub struct PredicateRegistry {
    gate_predicates: HashMap<String, GatePredicate>,
    conditions: HashMap<String, Condition>,
}

impl Default for PredicateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PredicateRegistry {
    pub fn empty() -> Self {
        Self {
            gate_predicates: HashMap::new(),
            conditions: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();

        registry.register_gate_predicate("within_failure_tolerance", |ctx| {
            let settlement = ctx.settlement();
            if settlement.tolerance_exceeded {
                GateVerdict::Rejected(format!(
                    "{} blocking task(s) failed (tolerance {}): {}",
                    settlement.blocking_failures.len(),
                    ctx.failure_tolerance,
                    settlement.blocking_failures.join(", ")
                ))
            } else if settlement.is_settled() {
                GateVerdict::Approved
            } else {
                GateVerdict::Pending
            }
        });

        registry.register_gate_predicate("all_tasks_completed", |ctx| {
            let failed: Vec<&str> = ctx
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed && !t.waived)
                .map(|t| t.id.as_str())
                .collect();
            if !failed.is_empty() {
                return GateVerdict::Rejected(format!("failed task(s): {}", failed.join(", ")));
            }
            if ctx.settlement().is_settled() {
                GateVerdict::Approved
            } else {
                GateVerdict::Pending
            }
        });

        registry.register_gate_predicate("always", |_| GateVerdict::Approved);

        registry.register_condition("low_ambiguity", |state, thresholds| {
            state
                .signals
                .get("ambiguity")
                .is_some_and(|score| *score < thresholds.clarify_ambiguity)
        });
        registry.register_condition("no_ui_changes", |state, _| !state.profile.has_ui);
        registry.register_condition("trivial_feature", |state, _| {
            state.profile.flag_count() == 0
        });
        registry.register_condition("never", |_, _| false);

        registry
    }

    pub fn register_gate_predicate<F>(&mut self, name: &str, predicate: F)
    where
        F: Fn(&PhaseContext<'_>) -> GateVerdict + Send + Sync + 'static,
    {
        self.gate_predicates
            .insert(name.to_string(), Arc::new(predicate));
    }

    pub fn register_condition<F>(&mut self, name: &str, condition: F)
    where
        F: Fn(&WorkflowState, &Thresholds) -> bool + Send + Sync + 'static,
    {
        self.conditions.insert(name.to_string(), Arc::new(condition));
    }

    pub fn gate_predicate(&self, name: &str) -> Result<&GatePredicate> {
        self.gate_predicates
            .get(name)
            .ok_or_else(|| StageflowError::UnknownPredicate {
                name: name.to_string(),
            })
    }

    pub fn condition(&self, name: &str) -> Result<&Condition> {
        self.conditions
            .get(name)
            .ok_or_else(|| StageflowError::UnknownPredicate {
                name: name.to_string(),
            })
    }

    pub fn has_gate_predicate(&self, name: &str) -> bool {
        self.gate_predicates.contains_key(name)
    }

    pub fn has_condition(&self, name: &str) -> bool {
        self.conditions.contains_key(name)
    }
}
