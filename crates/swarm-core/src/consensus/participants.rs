//! Debate participants and candidate selection.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AgentId, AgentVote, Capability, DebatePhase, DebateRound, SwarmError, SwarmResult,
};
use crate::scheduler::HookError;

/// Bonus weight of a participant's historical consensus rate.
const CONSENSUS_RATE_BONUS: f64 = 0.3;

/// Contract implemented by agents taking part in debates.
#[async_trait]
pub trait DebateParticipant: Send + Sync {
    /// Statement for a speaking phase (opening, cross-examination, deliberation).
    async fn statement(&self, round: &DebateRound, phase: DebatePhase) -> Result<String, HookError>;

    /// The participant's vote on `round.proposal`.
    async fn vote(&self, round: &DebateRound) -> Result<AgentVote, HookError>;
}

/// Selection-relevant record of a registered participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<Capability>,
    /// Topic -> expertise level.
    pub expertise: HashMap<String, f64>,
    pub debates_participated: u64,
    /// Finalized debates where this participant's vote matched the outcome.
    pub debates_agreed: u64,
}

impl ParticipantProfile {
    pub fn new(
        agent_id: AgentId,
        capabilities: BTreeSet<Capability>,
        expertise: HashMap<String, f64>,
    ) -> Self {
        Self {
            agent_id,
            capabilities,
            expertise,
            debates_participated: 0,
            debates_agreed: 0,
        }
    }

    /// Fraction of finalized debates in which this participant agreed with the outcome.
    pub fn consensus_rate(&self) -> f64 {
        if self.debates_participated == 0 {
            return 0.0;
        }
        self.debates_agreed as f64 / self.debates_participated as f64
    }

    fn expertise_in(&self, topic: &str) -> f64 {
        self.expertise.get(topic).copied().unwrap_or(0.0)
    }

    /// Non-zero expertise in at least one topic; any profile qualifies when none are required.
    pub fn covers(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|t| self.expertise_in(t) > 0.0)
    }

    /// Σ expertise over required topics plus 0.3 × consensus rate.
    pub fn selection_score(&self, required: &[String]) -> f64 {
        let expertise: f64 = required.iter().map(|t| self.expertise_in(t)).sum();
        expertise + CONSENSUS_RATE_BONUS * self.consensus_rate()
    }
}

/// Pick the top `min(2 × min_participants, max_participants)` eligible profiles.
///
/// Ties break by agent id. Fails when fewer than `min_participants` are eligible.
pub fn select_participants(
    eligible: &[ParticipantProfile],
    required: &[String],
    min_participants: usize,
    max_participants: usize,
) -> SwarmResult<Vec<AgentId>> {
    let min = min_participants.max(1);
    if eligible.len() < min {
        return Err(SwarmError::InsufficientParticipants {
            required: min,
            available: eligible.len(),
        });
    }

    let mut ranked: Vec<(f64, &AgentId)> = eligible
        .iter()
        .map(|p| (p.selection_score(required), &p.agent_id))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let take = (2 * min).min(max_participants).max(min);
    Ok(ranked
        .into_iter()
        .take(take)
        .map(|(_, id)| id.clone())
        .collect())
}
