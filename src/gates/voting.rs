//! Vote aggregation for vote gates.
//!
//! Strategies:
//! - `first_to_ahead_by_k`: walk votes in cast order; the first side to lead
//!   by `k` wins. If nobody gets there, fall back to simple majority.
//! - `unanimous`: any reject rejects; at least one approve is required.
//! - `majority`: more approves than rejects among non-abstain votes.
//! - `weighted`: compare summed weights of approves and rejects.
//!
//! Ties and all-abstain outcomes always reject.

use serde::{Deserialize, Serialize};
use stageflow_common::{Vote, VoteDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStrategy {
    #[default]
    FirstToAheadByK,
    Unanimous,
    Majority,
    Weighted,
}

impl std::fmt::Display for VoteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteStrategy::FirstToAheadByK => write!(f, "first_to_ahead_by_k"),
            VoteStrategy::Unanimous => write!(f, "unanimous"),
            VoteStrategy::Majority => write!(f, "majority"),
            VoteStrategy::Weighted => write!(f, "weighted"),
        }
    }
}

/// Result of aggregating a set of votes.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteTally {
    /// Approve or Reject; never Abstain
    pub decision: VoteDecision,
    pub approve_count: usize,
    pub reject_count: usize,
    pub abstain_count: usize,
    pub approve_weight: f64,
    pub reject_weight: f64,
    /// Votes consumed before a decision (all votes unless k-margin was hit)
    pub votes_used: usize,
    /// `first_to_ahead_by_k` only: a side reached the k-vote lead
    pub margin_reached: bool,
    /// The decision came from a tie-break
    pub tie: bool,
}

impl VoteTally {
    pub fn summary(&self) -> String {
        format!(
            "{} approve / {} reject / {} abstain",
            self.approve_count, self.reject_count, self.abstain_count
        )
    }
}

/// Aggregate `votes` with `strategy`. `k` only matters for `first_to_ahead_by_k`.
pub fn aggregate(votes: &[Vote], strategy: VoteStrategy, k: u32) -> VoteTally {
    match strategy {
        VoteStrategy::FirstToAheadByK => first_to_ahead_by_k(votes, k.max(1) as i64),
        VoteStrategy::Unanimous => {
            let mut tally = count(votes);
            tally.decision = if tally.reject_count == 0 && tally.approve_count > 0 {
                VoteDecision::Approve
            } else {
                VoteDecision::Reject
            };
            tally
        }
        VoteStrategy::Majority => {
            let mut tally = count(votes);
            tally.tie = tally.approve_count == tally.reject_count;
            tally.decision = if tally.approve_count > tally.reject_count {
                VoteDecision::Approve
            } else {
                VoteDecision::Reject
            };
            tally
        }
        VoteStrategy::Weighted => {
            let mut tally = count(votes);
            tally.tie = tally.approve_weight == tally.reject_weight;
            tally.decision = if tally.approve_weight > tally.reject_weight {
                VoteDecision::Approve
            } else {
                VoteDecision::Reject
            };
            tally
        }
    }
}

fn count(votes: &[Vote]) -> VoteTally {
    let mut tally = VoteTally {
        decision: VoteDecision::Reject,
        approve_count: 0,
        reject_count: 0,
        abstain_count: 0,
        approve_weight: 0.0,
        reject_weight: 0.0,
        votes_used: votes.len(),
        margin_reached: false,
        tie: false,
    };
    for vote in votes {
        match vote.decision {
            VoteDecision::Approve => {
                tally.approve_count += 1;
                tally.approve_weight += vote.weight;
            }
            VoteDecision::Reject => {
                tally.reject_count += 1;
                tally.reject_weight += vote.weight;
            }
            VoteDecision::Abstain => tally.abstain_count += 1,
        }
    }
    tally
}

fn first_to_ahead_by_k(votes: &[Vote], k: i64) -> VoteTally {
    let mut prefix = Vec::with_capacity(votes.len());
    for vote in votes {
        prefix.push(vote.clone());
        let tally = count(&prefix);
        let margin = tally.approve_count as i64 - tally.reject_count as i64;
        if margin >= k || -margin >= k {
            return VoteTally {
                decision: if margin > 0 {
                    VoteDecision::Approve
                } else {
                    VoteDecision::Reject
                },
                margin_reached: true,
                ..tally
            };
        }
    }

    let mut tally = count(votes);
    tally.tie = tally.approve_count == tally.reject_count;
    tally.decision = if tally.approve_count > tally.reject_count {
        VoteDecision::Approve
    } else {
        VoteDecision::Reject
    };
    tally
}
