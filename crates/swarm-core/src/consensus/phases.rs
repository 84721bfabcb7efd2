//! Phase ordering, vote validation and debate message construction.

use tracing::warn;

use crate::domain::{
    AgentId, AgentVote, DebateId, DebatePhase, DebateRound, MessageType, SwarmError, SwarmResult,
    SwarmMessage,
};

/// Sender id used for engine-originated messages.
pub const ENGINE_SENDER: &str = "consensus-engine";

/// Check that `to` moves strictly forward from `from`.
///
/// Returns `true` when intermediate phases are skipped.
pub fn check_transition(
    debate_id: &DebateId,
    from: DebatePhase,
    to: DebatePhase,
) -> SwarmResult<bool> {
    if to <= from {
        return Err(SwarmError::InvalidPhaseTransition {
            debate_id: debate_id.clone(),
            from,
            to,
        });
    }
    let skipped = from.next() != Some(to);
    if skipped {
        warn!(debate_id = %debate_id, from = from.as_str(), to = to.as_str(), "phases skipped");
    }
    Ok(skipped)
}

/// Validate a vote returned by `from`. Confidence is clamped into `[0, 1]`.
///
/// Rejects votes attributed to another agent, from non-participants, for a
/// different proposal, or from an agent that already voted.
pub fn accept_vote(round: &DebateRound, from: &AgentId, mut vote: AgentVote) -> Option<AgentVote> {
    let reason = if &vote.agent_id != from {
        Some("vote attributed to another agent")
    } else if !round.participants.contains(from) {
        Some("voter is not a participant")
    } else if vote.proposal_id != round.proposal.id {
        Some("vote targets a different proposal")
    } else if round.vote_of(from).is_some() {
        Some("participant already voted")
    } else {
        None
    };

    if let Some(reason) = reason {
        warn!(debate_id = %round.round_id, agent_id = %from, reason, "vote rejected");
        return None;
    }

    vote.confidence = if vote.confidence.is_nan() {
        0.0
    } else {
        vote.confidence.clamp(0.0, 1.0)
    };
    Some(vote)
}

fn engine_event(round: &DebateRound, event: &str, content: serde_json::Value) -> SwarmMessage {
    SwarmMessage::new(ENGINE_SENDER, MessageType::Event, content)
        .in_thread(round.round_id.as_str())
        .with_trace(round.round_id.as_str(), event)
}

/// One `debate_initiated` proposal per selected participant, sent to its inbox.
pub fn initiation_messages(round: &DebateRound) -> Vec<SwarmMessage> {
    round
        .participants
        .iter()
        .map(|p| {
            SwarmMessage::new(
                round.proposal.proposed_by.clone(),
                MessageType::Proposal,
                serde_json::json!({
                    "event": "debate_initiated",
                    "debate_id": round.round_id,
                    "proposal": round.proposal,
                    "participants": round.participants,
                }),
            )
            .to(p.clone())
            .in_thread(round.round_id.as_str())
        })
        .collect()
}

pub fn statement_message(
    round: &DebateRound,
    agent_id: &AgentId,
    phase: DebatePhase,
    statement: &str,
) -> SwarmMessage {
    SwarmMessage::new(
        agent_id.clone(),
        MessageType::Response,
        serde_json::json!({
            "debate_id": round.round_id,
            "phase": phase,
            "statement": statement,
        }),
    )
    .in_thread(round.round_id.as_str())
}

pub fn vote_message(round: &DebateRound, vote: &AgentVote) -> SwarmMessage {
    SwarmMessage::new(
        vote.agent_id.clone(),
        MessageType::Vote,
        serde_json::json!({ "debate_id": round.round_id, "vote": vote }),
    )
    .in_thread(round.round_id.as_str())
}

pub fn round_completed_message(round: &DebateRound, phase: DebatePhase, duration_ms: u64) -> SwarmMessage {
    engine_event(
        round,
        "round_completed",
        serde_json::json!({
            "event": "round_completed",
            "debate_id": round.round_id,
            "phase": phase,
            "duration_ms": duration_ms,
        }),
    )
}

pub fn consensus_message(round: &DebateRound) -> SwarmMessage {
    let reached = round.outcome.as_ref().is_some_and(|o| o.consensus_reached);
    let event = if reached {
        "consensus_reached"
    } else {
        "consensus_failed"
    };
    engine_event(
        round,
        event,
        serde_json::json!({
            "event": event,
            "debate_id": round.round_id,
            "outcome": round.outcome,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DebateProposal, VoteDecision};
    use chrono::Utc;

    fn round() -> DebateRound {
        DebateRound::new(
            DebateId::from("d1"),
            DebateProposal::new("Adopt X", "details", "alice"),
            vec![AgentId::from("a"), AgentId::from("b")],
            Utc::now(),
        )
    }

    fn vote(r: &DebateRound, agent: &str, confidence: f64) -> AgentVote {
        AgentVote {
            agent_id: AgentId::from(agent),
            proposal_id: r.proposal.id.clone(),
            vote: VoteDecision::Approve,
            reasoning: "ok".into(),
            confidence,
        }
    }

    #[test]
    fn transitions_only_move_forward() {
        let id = DebateId::from("d1");
        assert_eq!(
            check_transition(&id, DebatePhase::Initialization, DebatePhase::OpeningStatements)
                .unwrap(),
            false
        );
        assert!(check_transition(&id, DebatePhase::Initialization, DebatePhase::Voting).unwrap());
        assert!(check_transition(&id, DebatePhase::Voting, DebatePhase::Voting).is_err());
        assert!(check_transition(&id, DebatePhase::Voting, DebatePhase::Deliberation).is_err());
    }

    #[test]
    fn vote_confidence_is_clamped() {
        let r = round();
        let accepted = accept_vote(&r, &AgentId::from("a"), vote(&r, "a", 3.0)).unwrap();
        assert_eq!(accepted.confidence, 1.0);
        let accepted = accept_vote(&r, &AgentId::from("b"), vote(&r, "b", f64::NAN)).unwrap();
        assert_eq!(accepted.confidence, 0.0);
    }

    #[test]
    fn invalid_votes_are_rejected() {
        let mut r = round();
        let a = AgentId::from("a");
        // Wrong author.
        assert!(accept_vote(&r, &a, vote(&r, "b", 0.5)).is_none());
        // Non-participant.
        assert!(accept_vote(&r, &AgentId::from("z"), vote(&r, "z", 0.5)).is_none());
        // Wrong proposal.
        let mut other = vote(&r, "a", 0.5);
        other.proposal_id = "elsewhere".into();
        assert!(accept_vote(&r, &a, other).is_none());
        // Second vote.
        let first = accept_vote(&r, &a, vote(&r, "a", 0.5)).unwrap();
        r.votes.push(first);
        assert!(accept_vote(&r, &a, vote(&r, "a", 0.9)).is_none());
    }

    #[test]
    fn initiation_reaches_every_participant_inbox() {
        let r = round();
        let msgs = initiation_messages(&r);
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.thread_id == "d1"));
        assert_eq!(msgs[1].receiver_agent_id, Some(AgentId::from("b")));
        assert_eq!(msgs[0].content["event"], "debate_initiated");
    }
}
