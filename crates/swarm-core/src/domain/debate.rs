//! Debate proposals, votes and rounds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, DebateId};

/// A proposal put up for debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateProposal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub proposed_by: AgentId,
    pub evidence: Vec<String>,
    pub supporting_data: serde_json::Value,
}

impl DebateProposal {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        proposed_by: impl Into<AgentId>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            proposed_by: proposed_by.into(),
            evidence: Vec::new(),
            supporting_data: serde_json::Value::Null,
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
    Abstain,
    Modify,
}

/// One participant's vote on a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVote {
    pub agent_id: AgentId,
    pub proposal_id: String,
    pub vote: VoteDecision,
    pub reasoning: String,
    /// Clamped into `[0, 1]` when recorded.
    pub confidence: f64,
}

/// A statement made by a participant during a speaking phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatement {
    pub agent_id: AgentId,
    pub phase: DebatePhase,
    pub content: String,
    pub made_at: DateTime<Utc>,
}

/// Debate phases in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebatePhase {
    Initialization,
    OpeningStatements,
    CrossExamination,
    Deliberation,
    Voting,
    Consensus,
}

impl DebatePhase {
    /// The phase that follows this one, if any.
    pub fn next(self) -> Option<DebatePhase> {
        use DebatePhase::*;
        match self {
            Initialization => Some(OpeningStatements),
            OpeningStatements => Some(CrossExamination),
            CrossExamination => Some(Deliberation),
            Deliberation => Some(Voting),
            Voting => Some(Consensus),
            Consensus => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        use DebatePhase::*;
        match self {
            Initialization => "initialization",
            OpeningStatements => "opening_statements",
            CrossExamination => "cross_examination",
            Deliberation => "deliberation",
            Voting => "voting",
            Consensus => "consensus",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStatus {
    Active,
    Finalized,
    Expired,
}

/// Tally of a round's votes and the resulting decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateOutcome {
    pub approve: usize,
    pub reject: usize,
    pub abstain: usize,
    pub modify: usize,
    pub total_votes: usize,
    pub approve_ratio: f64,
    pub consensus_reached: bool,
    pub decided_at: DateTime<Utc>,
}

impl DebateOutcome {
    /// Tally `votes`. Consensus is reached iff `approve / total >= threshold`;
    /// zero votes never reach consensus.
    pub fn evaluate(votes: &[AgentVote], threshold: f64, now: DateTime<Utc>) -> Self {
        let count = |d: VoteDecision| votes.iter().filter(|v| v.vote == d).count();
        let approve = count(VoteDecision::Approve);
        let total_votes = votes.len();
        let approve_ratio = if total_votes == 0 {
            0.0
        } else {
            approve as f64 / total_votes as f64
        };

        Self {
            approve,
            reject: count(VoteDecision::Reject),
            abstain: count(VoteDecision::Abstain),
            modify: count(VoteDecision::Modify),
            total_votes,
            approve_ratio,
            consensus_reached: total_votes > 0 && approve_ratio >= threshold,
            decided_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: DebatePhase,
    pub duration_ms: u64,
}

/// The single round a debate owns while active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateRound {
    pub round_id: DebateId,
    pub phase: DebatePhase,
    pub status: DebateStatus,
    pub proposal: DebateProposal,
    pub participants: Vec<AgentId>,
    pub statements: Vec<AgentStatement>,
    pub votes: Vec<AgentVote>,
    pub outcome: Option<DebateOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase_timings: Vec<PhaseTiming>,
}

impl DebateRound {
    pub fn new(
        round_id: DebateId,
        proposal: DebateProposal,
        participants: Vec<AgentId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            round_id,
            phase: DebatePhase::Initialization,
            status: DebateStatus::Active,
            proposal,
            participants,
            statements: Vec::new(),
            votes: Vec::new(),
            outcome: None,
            started_at: now,
            finished_at: None,
            phase_timings: Vec::new(),
        }
    }

    pub fn vote_of(&self, agent_id: &AgentId) -> Option<&AgentVote> {
        self.votes.iter().find(|v| &v.agent_id == agent_id)
    }

    pub fn statements_in(&self, phase: DebatePhase) -> impl Iterator<Item = &AgentStatement> {
        self.statements.iter().filter(move |s| s.phase == phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(agent: &str, decision: VoteDecision) -> AgentVote {
        AgentVote {
            agent_id: AgentId::from(agent),
            proposal_id: "p".into(),
            vote: decision,
            reasoning: String::new(),
            confidence: 1.0,
        }
    }

    #[test]
    fn zero_votes_never_reach_consensus() {
        let outcome = DebateOutcome::evaluate(&[], 0.0, Utc::now());
        assert_eq!(outcome.total_votes, 0);
        assert_eq!(outcome.approve_ratio, 0.0);
        assert!(!outcome.consensus_reached);
    }

    #[test]
    fn ratio_at_threshold_reaches_consensus() {
        let votes: Vec<_> = (0..7)
            .map(|i| vote(&format!("a{i}"), VoteDecision::Approve))
            .chain((0..3).map(|i| vote(&format!("r{i}"), VoteDecision::Reject)))
            .collect();
        let outcome = DebateOutcome::evaluate(&votes, 0.7, Utc::now());
        assert_eq!(outcome.approve, 7);
        assert_eq!(outcome.reject, 3);
        assert!((outcome.approve_ratio - 0.7).abs() < 1e-12);
        assert!(outcome.consensus_reached);
    }

    #[test]
    fn abstentions_count_toward_the_total() {
        let votes = vec![
            vote("a", VoteDecision::Approve),
            vote("b", VoteDecision::Approve),
            vote("c", VoteDecision::Abstain),
            vote("d", VoteDecision::Modify),
        ];
        let outcome = DebateOutcome::evaluate(&votes, 0.7, Utc::now());
        assert_eq!(outcome.approve_ratio, 0.5);
        assert_eq!(outcome.abstain, 1);
        assert_eq!(outcome.modify, 1);
        assert!(!outcome.consensus_reached);
    }

    #[test]
    fn phases_advance_in_order() {
        let mut phase = DebatePhase::Initialization;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            phase = next;
            seen.push(phase);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(phase, DebatePhase::Consensus);
    }
}
