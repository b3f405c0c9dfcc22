//! Phase gates: approval checkpoints that guard every phase transition.
//!
//! Each phase has at most one gate, described by a [`GateDefinition`]. The
//! persisted [`GateRecord`] in the workflow document carries its status.
//! Decisions are terminal (`pending -> approved | rejected`); only a phase
//! retry reopens a gate.

pub mod predicates;
pub mod voting;

use serde::{Deserialize, Serialize};
use stageflow_common::{
    GateKind, GateRecord, GateStatus, Phase, Vote, VoteDecision, WorkflowState,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::errors::{Result, StageflowError};
pub use predicates::{GateVerdict, PhaseContext, PredicateRegistry, Settlement, Thresholds};
pub use voting::{VoteStrategy, VoteTally};

/// Static description of the gate that guards one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDefinition {
    pub name: String,
    pub phase: Phase,
    pub kind: GateKind,
    /// Automated gates: the gate predicate to evaluate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Manual gates: a condition that approves the gate without a human
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_when: Option<String>,
    #[serde(default)]
    pub strategy: VoteStrategy,
    #[serde(default = "default_k")]
    pub k: u32,
    #[serde(default = "default_quorum")]
    pub quorum: usize,
}

pub(crate) fn default_k() -> u32 {
    2
}

pub(crate) fn default_quorum() -> usize {
    3
}

impl GateDefinition {
    pub fn automated(name: &str, phase: Phase, predicate: &str) -> Self {
        Self {
            name: name.to_string(),
            phase,
            kind: GateKind::Automated,
            predicate: Some(predicate.to_string()),
            auto_approve_when: None,
            strategy: VoteStrategy::default(),
            k: default_k(),
            quorum: default_quorum(),
        }
    }

    pub fn manual(name: &str, phase: Phase) -> Self {
        Self {
            kind: GateKind::Manual,
            predicate: None,
            ..Self::automated(name, phase, "")
        }
    }

    pub fn vote(name: &str, phase: Phase, strategy: VoteStrategy, k: u32, quorum: usize) -> Self {
        Self {
            kind: GateKind::Vote,
            strategy,
            k,
            quorum,
            ..Self::manual(name, phase)
        }
    }

    pub fn with_auto_approve(mut self, condition: &str) -> Self {
        self.auto_approve_when = Some(condition.to_string());
        self
    }
}

/// Gates applied when configuration does not override them.
///
/// clarify, tasks and finalize are ungated.
pub fn default_gates() -> Vec<GateDefinition> {
    vec![
        GateDefinition::automated("spec-complete", Phase::Spec, "within_failure_tolerance"),
        GateDefinition::manual("plan-review", Phase::Plan),
        GateDefinition::automated(
            "implement-complete",
            Phase::Implement,
            "within_failure_tolerance",
        ),
        GateDefinition::automated("optimize-quality", Phase::Optimize, "all_tasks_completed"),
        GateDefinition::manual("ship-approval", Phase::Ship).with_auto_approve("no_ui_changes"),
    ]
}

/// Evaluates and records gate decisions for a workflow.
#[derive(Clone)]
pub struct GateController {
    definitions: BTreeMap<Phase, GateDefinition>,
    registry: PredicateRegistry,
    thresholds: Thresholds,
}

impl GateController {
    /// Build a controller, rejecting definitions that name unknown predicates
    /// or reuse a gate name.
    pub fn new(
        definitions: Vec<GateDefinition>,
        registry: PredicateRegistry,
        thresholds: Thresholds,
    ) -> Result<Self> {
        let mut by_phase = BTreeMap::new();
        for def in definitions {
            if by_phase
                .values()
                .any(|existing: &GateDefinition| existing.name == def.name)
            {
                return Err(StageflowError::InvalidConfig(format!(
                    "gate name '{}' is used by more than one phase",
                    def.name
                )));
            }
            match def.kind {
                GateKind::Automated => {
                    let name = def.predicate.as_deref().ok_or_else(|| {
                        StageflowError::InvalidConfig(format!(
                            "automated gate '{}' has no predicate",
                            def.name
                        ))
                    })?;
                    registry.gate_predicate(name)?;
                }
                GateKind::Manual => {}
                GateKind::Vote => {
                    if def.quorum == 0 || def.k == 0 {
                        return Err(StageflowError::InvalidConfig(format!(
                            "vote gate '{}' needs quorum and k of at least 1",
                            def.name
                        )));
                    }
                }
            }
            if let Some(cond) = def.auto_approve_when.as_deref() {
                registry.condition(cond)?;
            }
            by_phase.insert(def.phase, def);
        }

        Ok(Self {
            definitions: by_phase,
            registry,
            thresholds,
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            definitions: default_gates().into_iter().map(|d| (d.phase, d)).collect(),
            registry: PredicateRegistry::with_builtins(),
            thresholds: Thresholds::default(),
        }
    }

    pub fn registry(&self) -> &PredicateRegistry {
        &self.registry
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn definitions(&self) -> impl Iterator<Item = &GateDefinition> {
        self.definitions.values()
    }

    pub fn definition_for(&self, phase: Phase) -> Option<&GateDefinition> {
        self.definitions.get(&phase)
    }

    pub fn definition(&self, name: &str) -> Option<&GateDefinition> {
        self.definitions.values().find(|d| d.name == name)
    }

    /// Insert a pending record for the gate guarding `phase` if it is missing.
    /// Returns the gate name, or `None` for an ungated phase.
    pub fn ensure_record(&self, state: &mut WorkflowState, phase: Phase) -> Option<String> {
        let def = self.definition_for(phase)?;
        state
            .gates
            .entry(def.name.clone())
            .or_insert_with(|| GateRecord::new(&def.name, phase, def.kind));
        Some(def.name.clone())
    }

    /// Evaluate the gate guarding `phase` without mutating anything.
    ///
    /// A decided record wins over re-evaluation, so a rejected gate stays
    /// rejected even if the phase output has since changed.
    pub fn evaluate(
        &self,
        state: &WorkflowState,
        phase: Phase,
        failure_tolerance: usize,
    ) -> Result<GateVerdict> {
        let Some(def) = self.definition_for(phase) else {
            return Ok(GateVerdict::Approved);
        };

        let record = state.gates.get(&def.name);
        if let Some(record) = record {
            match record.status {
                GateStatus::Approved => return Ok(GateVerdict::Approved),
                GateStatus::Rejected => {
                    return Ok(GateVerdict::Rejected(
                        record.reason.clone().unwrap_or_else(|| "rejected".into()),
                    ));
                }
                GateStatus::Pending => {}
            }
        }

        match def.kind {
            GateKind::Automated => {
                let name = def.predicate.as_deref().unwrap_or("always");
                let predicate = self.registry.gate_predicate(name)?;
                let ctx = PhaseContext::new(state, phase, failure_tolerance);
                Ok(predicate(&ctx))
            }
            GateKind::Manual => {
                if let Some(cond) = def.auto_approve_when.as_deref()
                    && (self.registry.condition(cond)?)(state, &self.thresholds)
                {
                    return Ok(GateVerdict::Approved);
                }
                Ok(GateVerdict::Pending)
            }
            GateKind::Vote => {
                let votes = record.map(|r| r.votes.as_slice()).unwrap_or_default();
                Ok(vote_verdict(def, votes))
            }
        }
    }

    /// Evaluate the gate for `phase` and persist any decision into `state`.
    pub fn settle(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        failure_tolerance: usize,
    ) -> Result<GateVerdict> {
        let Some(name) = self.ensure_record(state, phase) else {
            return Ok(GateVerdict::Approved);
        };
        let verdict = self.evaluate(state, phase, failure_tolerance)?;

        let Some(def) = self.definition_for(phase) else {
            return Ok(verdict);
        };
        let approver = match def.kind {
            GateKind::Automated => format!("rule:{}", def.predicate.as_deref().unwrap_or("always")),
            GateKind::Manual => format!("rule:{}", def.auto_approve_when.as_deref().unwrap_or("")),
            GateKind::Vote => format!("vote:{}", def.strategy),
        };

        if let Some(record) = state.gates.get_mut(&name)
            && record.status == GateStatus::Pending
        {
            match &verdict {
                GateVerdict::Approved => {
                    record.decide(GateStatus::Approved, &approver, None);
                    info!(gate = %name, phase = %phase, approver = %approver, "Gate approved");
                }
                GateVerdict::Rejected(reason) => {
                    record.decide(GateStatus::Rejected, &approver, Some(reason.clone()));
                    info!(gate = %name, phase = %phase, reason = %reason, "Gate rejected");
                }
                GateVerdict::Pending => debug!(gate = %name, phase = %phase, "Gate pending"),
            }
        }
        Ok(verdict)
    }

    /// Record a manual approval.
    pub fn approve(&self, state: &mut WorkflowState, gate: &str, approver: &str) -> Result<()> {
        let record = self.open_record(state, gate, GateKind::Manual, "manual approval")?;
        record.decide(GateStatus::Approved, approver, None);
        info!(workflow = %state.id, gate = %gate, approver = %approver, "Gate approved");
        Ok(())
    }

    /// Record a manual rejection. The reason is mandatory.
    pub fn reject(
        &self,
        state: &mut WorkflowState,
        gate: &str,
        approver: &str,
        reason: &str,
    ) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(StageflowError::MissingReason {
                action: format!("reject gate '{}'", gate),
            });
        }
        let record = self.open_record(state, gate, GateKind::Manual, "manual rejection")?;
        record.decide(GateStatus::Rejected, approver, Some(reason.to_string()));
        info!(workflow = %state.id, gate = %gate, reason = %reason, "Gate rejected");
        Ok(())
    }

    /// Cast (or replace) a reviewer's vote and decide the gate if the votes
    /// now allow it.
    pub fn vote(&self, state: &mut WorkflowState, gate: &str, vote: Vote) -> Result<GateVerdict> {
        let def = self
            .definition(gate)
            .cloned()
            .ok_or_else(|| StageflowError::UnknownGate {
                id: state.id.clone(),
                gate: gate.to_string(),
            })?;
        let workflow = state.id.clone();
        let record = self.open_record(state, gate, GateKind::Vote, "votes")?;

        record.votes.retain(|v| v.voter != vote.voter);
        debug!(workflow = %workflow, gate = %gate, voter = %vote.voter, "Vote recorded");
        record.votes.push(vote);

        let verdict = vote_verdict(&def, &record.votes);
        let approver = format!("vote:{}", def.strategy);
        match &verdict {
            GateVerdict::Approved => record.decide(GateStatus::Approved, &approver, None),
            GateVerdict::Rejected(reason) => {
                record.decide(GateStatus::Rejected, &approver, Some(reason.clone()))
            }
            GateVerdict::Pending => {}
        }
        Ok(verdict)
    }

    /// Reopen the gate guarding `phase`, clearing its decision and votes.
    pub fn reopen(&self, state: &mut WorkflowState, phase: Phase) {
        if let Some(name) = self.ensure_record(state, phase)
            && let Some(record) = state.gates.get_mut(&name)
        {
            record.reopen();
        }
    }

    fn open_record<'s>(
        &self,
        state: &'s mut WorkflowState,
        gate: &str,
        expected: GateKind,
        action: &str,
    ) -> Result<&'s mut GateRecord> {
        let def = self
            .definition(gate)
            .ok_or_else(|| StageflowError::UnknownGate {
                id: state.id.clone(),
                gate: gate.to_string(),
            })?;
        if def.kind != expected {
            return Err(StageflowError::WrongGateKind {
                gate: gate.to_string(),
                action: action.to_string(),
            });
        }
        if def.phase != state.phase {
            return Err(StageflowError::GateNotActive {
                gate: gate.to_string(),
                gate_phase: def.phase,
                current: state.phase,
            });
        }

        let record = state
            .gates
            .entry(def.name.clone())
            .or_insert_with(|| GateRecord::new(&def.name, def.phase, def.kind));
        if record.status.is_decided() {
            return Err(StageflowError::GateAlreadyDecided {
                gate: gate.to_string(),
                status: record.status,
            });
        }
        Ok(record)
    }
}

/// Votes below quorum stay pending unless `first_to_ahead_by_k` already
/// reached its margin.
fn vote_verdict(def: &GateDefinition, votes: &[Vote]) -> GateVerdict {
    if votes.is_empty() {
        return GateVerdict::Pending;
    }
    let tally = voting::aggregate(votes, def.strategy, def.k);
    if votes.len() < def.quorum && !tally.margin_reached {
        return GateVerdict::Pending;
    }
    match tally.decision {
        VoteDecision::Approve => GateVerdict::Approved,
        _ => GateVerdict::Rejected(format!("vote {} ({})", tally.summary(), def.strategy)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageflow_common::{FeatureProfile, Task, TaskDeclaration, TaskStatus};

    fn state_at(phase: Phase) -> WorkflowState {
        let mut state = WorkflowState::new("wf", "", FeatureProfile::default());
        state.phase = phase;
        state
    }

    fn add_task(state: &mut WorkflowState, id: &str, phase: Phase, status: TaskStatus) {
        let mut task = Task::from_declaration(TaskDeclaration::new(id, id, vec![]), phase);
        task.status = status;
        state.tasks.push(task);
    }

    #[test]
    fn test_ungated_phase_is_approved() {
        let controller = GateController::with_defaults();
        let mut state = state_at(Phase::Clarify);
        assert_eq!(
            controller.settle(&mut state, Phase::Clarify, 0).unwrap(),
            GateVerdict::Approved
        );
        assert!(state.gates.is_empty());
    }

    #[test]
    fn test_automated_gate_records_rule_approver() {
        let controller = GateController::with_defaults();
        let mut state = state_at(Phase::Spec);
        add_task(&mut state, "T1", Phase::Spec, TaskStatus::Completed);

        let verdict = controller.settle(&mut state, Phase::Spec, 0).unwrap();
        assert_eq!(verdict, GateVerdict::Approved);
        let record = &state.gates["spec-complete"];
        assert_eq!(record.status, GateStatus::Approved);
        assert_eq!(record.approver.as_deref(), Some("rule:within_failure_tolerance"));
    }

    #[test]
    fn test_rejected_gate_stays_rejected() {
        let controller = GateController::with_defaults();
        let mut state = state_at(Phase::Implement);
        add_task(&mut state, "T1", Phase::Implement, TaskStatus::Failed);

        let verdict = controller.settle(&mut state, Phase::Implement, 0).unwrap();
        assert!(matches!(verdict, GateVerdict::Rejected(_)));

        // Repairing the output does not silently flip the decision
        state.tasks[0].status = TaskStatus::Completed;
        let again = controller.evaluate(&state, Phase::Implement, 0).unwrap();
        assert!(matches!(again, GateVerdict::Rejected(_)));

        controller.reopen(&mut state, Phase::Implement);
        assert_eq!(
            controller.settle(&mut state, Phase::Implement, 0).unwrap(),
            GateVerdict::Approved
        );
    }

    #[test]
    fn test_manual_gate_requires_approval() {
        let controller = GateController::with_defaults();
        let mut state = state_at(Phase::Plan);
        assert_eq!(
            controller.settle(&mut state, Phase::Plan, 0).unwrap(),
            GateVerdict::Pending
        );

        controller.approve(&mut state, "plan-review", "alice").unwrap();
        assert_eq!(
            controller.evaluate(&state, Phase::Plan, 0).unwrap(),
            GateVerdict::Approved
        );
        assert_eq!(state.gates["plan-review"].approver.as_deref(), Some("alice"));
    }

    #[test]
    fn test_decided_gate_cannot_be_decided_again() {
        let controller = GateController::with_defaults();
        let mut state = state_at(Phase::Plan);
        controller
            .reject(&mut state, "plan-review", "bob", "no rollback plan")
            .unwrap();

        let err = controller
            .approve(&mut state, "plan-review", "alice")
            .unwrap_err();
        assert!(matches!(
            err,
            StageflowError::GateAlreadyDecided {
                status: GateStatus::Rejected,
                ..
            }
        ));
    }

    #[test]
    fn test_reject_requires_reason() {
        let controller = GateController::with_defaults();
        let mut state = state_at(Phase::Plan);
        assert!(controller.reject(&mut state, "plan-review", "bob", "  ").is_err());
        assert_eq!(state.gates.len(), 0);
    }

    #[test]
    fn test_approve_wrong_kind_or_phase() {
        let controller = GateController::with_defaults();
        let mut state = state_at(Phase::Spec);

        assert!(matches!(
            controller.approve(&mut state, "spec-complete", "alice"),
            Err(StageflowError::WrongGateKind { .. })
        ));
        assert!(matches!(
            controller.approve(&mut state, "plan-review", "alice"),
            Err(StageflowError::GateNotActive { .. })
        ));
        assert!(matches!(
            controller.approve(&mut state, "nope", "alice"),
            Err(StageflowError::UnknownGate { .. })
        ));
    }

    #[test]
    fn test_ship_auto_approves_without_ui() {
        let controller = GateController::with_defaults();
        let mut state = state_at(Phase::Ship);
        assert_eq!(
            controller.settle(&mut state, Phase::Ship, 0).unwrap(),
            GateVerdict::Approved
        );
        assert_eq!(
            state.gates["ship-approval"].approver.as_deref(),
            Some("rule:no_ui_changes")
        );

        let mut ui = state_at(Phase::Ship);
        ui.profile.has_ui = true;
        assert_eq!(
            controller.settle(&mut ui, Phase::Ship, 0).unwrap(),
            GateVerdict::Pending
        );
    }

    #[test]
    fn test_vote_gate_waits_for_quorum() {
        let controller = GateController::new(
            vec![GateDefinition::vote(
                "plan-vote",
                Phase::Plan,
                VoteStrategy::Majority,
                2,
                3,
            )],
            PredicateRegistry::with_builtins(),
            Thresholds::default(),
        )
        .unwrap();
        let mut state = state_at(Phase::Plan);

        let v1 = controller
            .vote(&mut state, "plan-vote", Vote::new("a", VoteDecision::Approve, 1.0))
            .unwrap();
        assert_eq!(v1, GateVerdict::Pending);
        // Re-voting replaces the earlier ballot
        controller
            .vote(&mut state, "plan-vote", Vote::new("a", VoteDecision::Reject, 1.0))
            .unwrap();
        assert_eq!(state.gates["plan-vote"].votes.len(), 1);

        controller
            .vote(&mut state, "plan-vote", Vote::new("b", VoteDecision::Approve, 1.0))
            .unwrap();
        let v3 = controller
            .vote(&mut state, "plan-vote", Vote::new("c", VoteDecision::Approve, 1.0))
            .unwrap();
        assert_eq!(v3, GateVerdict::Approved);
        assert_eq!(state.gates["plan-vote"].approver.as_deref(), Some("vote:majority"));
    }

    #[test]
    fn test_vote_gate_decides_early_on_margin() {
        let controller = GateController::new(
            vec![GateDefinition::vote(
                "plan-vote",
                Phase::Plan,
                VoteStrategy::FirstToAheadByK,
                2,
                5,
            )],
            PredicateRegistry::with_builtins(),
            Thresholds::default(),
        )
        .unwrap();
        let mut state = state_at(Phase::Plan);

        controller
            .vote(&mut state, "plan-vote", Vote::new("a", VoteDecision::Reject, 1.0))
            .unwrap();
        let verdict = controller
            .vote(&mut state, "plan-vote", Vote::new("b", VoteDecision::Reject, 1.0))
            .unwrap();
        assert!(matches!(verdict, GateVerdict::Rejected(_)));
        assert!(matches!(
            controller.vote(&mut state, "plan-vote", Vote::new("c", VoteDecision::Approve, 1.0)),
            Err(StageflowError::GateAlreadyDecided { .. })
        ));
    }

    #[test]
    fn test_new_rejects_unknown_predicate() {
        let result = GateController::new(
            vec![GateDefinition::automated("x", Phase::Spec, "vibes")],
            PredicateRegistry::with_builtins(),
            Thresholds::default(),
        );
        assert!(matches!(result, Err(StageflowError::UnknownPredicate { .. })));
    }

    #[test]
    fn test_new_rejects_duplicate_names() {
        let result = GateController::new(
            vec![
                GateDefinition::manual("review", Phase::Plan),
                GateDefinition::manual("review", Phase::Ship),
            ],
            PredicateRegistry::with_builtins(),
            Thresholds::default(),
        );
        assert!(matches!(result, Err(StageflowError::InvalidConfig(_))));
    }
}
