//! Consensus engine: structured multi-agent debates over proposals.
//!
//! Each active debate owns one round behind its own mutex, held for the
//! whole of a phase, so phases of one debate never overlap while separate
//! debates proceed in parallel.

mod participants;
mod phases;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::bus::MessageBus;
use crate::config::ConsensusConfig;
use crate::directory::AgentDirectory;
use crate::domain::{
    AgentId, AgentStatement, Capability, DebateId, DebateOutcome, DebatePhase, DebateProposal,
    DebateRound, DebateStatus, PhaseTiming, RegistrationStatus, SwarmError, SwarmMessage,
    SwarmResult, VoteDecision,
};
use crate::metrics::METRICS;
use crate::obs::{self, DebateSpan};

pub use participants::{select_participants, DebateParticipant, ParticipantProfile};
pub use phases::{accept_vote, check_transition, ENGINE_SENDER};

struct Participant {
    profile: ParticipantProfile,
    contract: Arc<dyn DebateParticipant>,
}

pub struct ConsensusEngine {
    directory: Arc<AgentDirectory>,
    bus: Arc<MessageBus>,
    config: ConsensusConfig,
    participants: RwLock<BTreeMap<AgentId, Participant>>,
    active: RwLock<HashMap<DebateId, Arc<Mutex<DebateRound>>>>,
    history: RwLock<HashMap<DebateId, DebateRound>>,
}

impl ConsensusEngine {
    pub fn new(directory: Arc<AgentDirectory>, bus: Arc<MessageBus>, config: ConsensusConfig) -> Self {
        Self {
            directory,
            bus,
            config,
            participants: RwLock::new(BTreeMap::new()),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Add an agent to the pool eligible for future debates.
    pub async fn register_participant(
        &self,
        agent_id: AgentId,
        capabilities: BTreeSet<Capability>,
        expertise: HashMap<String, f64>,
        contract: Arc<dyn DebateParticipant>,
    ) -> SwarmResult<()> {
        let mut participants = self.participants.write().await;
        if participants.contains_key(&agent_id) {
            return Err(SwarmError::DuplicateAgent(agent_id));
        }
        debug!(agent_id = %agent_id, topics = expertise.len(), "debate participant registered");
        participants.insert(
            agent_id.clone(),
            Participant {
                profile: ParticipantProfile::new(agent_id, capabilities, expertise),
                contract,
            },
        );
        Ok(())
    }

    /// Remove a participant. Debates already underway skip it from then on.
    pub async fn unregister_participant(&self, agent_id: &AgentId) -> bool {
        self.participants.write().await.remove(agent_id).is_some()
    }

    pub async fn participant(&self, agent_id: &AgentId) -> Option<ParticipantProfile> {
        self.participants
            .read()
            .await
            .get(agent_id)
            .map(|p| p.profile.clone())
    }

    async fn eligible_profiles(&self, required: &[String]) -> Vec<ParticipantProfile> {
        let candidates: Vec<ParticipantProfile> = self
            .participants
            .read()
            .await
            .values()
            .filter(|p| p.profile.covers(required))
            .map(|p| p.profile.clone())
            .collect();

        let mut eligible = Vec::with_capacity(candidates.len());
        for profile in candidates {
            let suspended = self
                .directory
                .get(&profile.agent_id)
                .await
                .is_some_and(|a| a.registration_status == RegistrationStatus::Suspended);
            if !suspended {
                eligible.push(profile);
            }
        }
        eligible
    }

    // -- debates ----------------------------------------------------------------

    /// Select participants, open a round in `Initialization` and notify each
    /// selected participant.
    pub async fn initiate_debate(
        &self,
        proposal: DebateProposal,
        required_expertise: &[String],
        min_participants: usize,
    ) -> SwarmResult<DebateId> {
        let eligible = self.eligible_profiles(required_expertise).await;
        let selected = select_participants(
            &eligible,
            required_expertise,
            min_participants,
            self.config.max_participants,
        )?;

        let debate_id = DebateId::generate();
        let round = DebateRound::new(debate_id.clone(), proposal, selected, Utc::now());

        for message in phases::initiation_messages(&round) {
            self.bus.publish(&message).await?;
        }

        let participants = round.participants.len();
        self.active
            .write()
            .await
            .insert(debate_id.clone(), Arc::new(Mutex::new(round)));

        METRICS.inc_debates_initiated();
        obs::emit_debate_initiated(&debate_id, participants);
        Ok(debate_id)
    }

    async fn active_round(&self, debate_id: &DebateId) -> SwarmResult<Arc<Mutex<DebateRound>>> {
        self.active
            .read()
            .await
            .get(debate_id)
            .cloned()
            .ok_or_else(|| SwarmError::DebateNotFound(debate_id.clone()))
    }

    /// Run `phase` for an active debate and return the updated round.
    pub async fn advance_round(
        &self,
        debate_id: &DebateId,
        phase: DebatePhase,
    ) -> SwarmResult<DebateRound> {
        let round = self.active_round(debate_id).await?;
        self.advance(&round, debate_id, phase).await
    }

    async fn advance(
        &self,
        round: &Mutex<DebateRound>,
        debate_id: &DebateId,
        phase: DebatePhase,
    ) -> SwarmResult<DebateRound> {
        let mut round = round.lock().await;
        // Closed while this call waited on the lock.
        if round.status != DebateStatus::Active {
            return Err(SwarmError::DebateNotFound(debate_id.clone()));
        }
        check_transition(debate_id, round.phase, phase)?;

        let started = Instant::now();
        self.run_phase(&mut round, phase)
            .instrument(DebateSpan::span(debate_id))
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        round.phase = phase;
        round.phase_timings.push(PhaseTiming { phase, duration_ms });
        obs::emit_debate_phase(debate_id, phase, duration_ms);
        self.publish_quietly(&phases::round_completed_message(&round, phase, duration_ms))
            .await;

        Ok(round.clone())
    }

    async fn run_phase(&self, round: &mut DebateRound, phase: DebatePhase) {
        match phase {
            DebatePhase::Initialization => {}
            DebatePhase::OpeningStatements
            | DebatePhase::CrossExamination
            | DebatePhase::Deliberation => self.collect_statements(round, phase).await,
            DebatePhase::Voting => self.collect_votes(round).await,
            DebatePhase::Consensus => {
                round.outcome = Some(DebateOutcome::evaluate(
                    &round.votes,
                    self.config.consensus_threshold,
                    Utc::now(),
                ));
                self.publish_quietly(&phases::consensus_message(round)).await;
            }
        }
    }

    async fn contracts(&self, ids: &[AgentId]) -> Vec<(AgentId, Arc<dyn DebateParticipant>)> {
        let participants = self.participants.read().await;
        ids.iter()
            .filter_map(|id| {
                participants
                    .get(id)
                    .map(|p| (id.clone(), Arc::clone(&p.contract)))
            })
            .collect()
    }

    async fn collect_statements(&self, round: &mut DebateRound, phase: DebatePhase) {
        let contracts = self.contracts(&round.participants).await;
        let snapshot: &DebateRound = round;
        let results = join_all(contracts.iter().map(|(id, contract)| async move {
            (id, contract.statement(snapshot, phase).await)
        }))
        .await;

        let mut statements = Vec::with_capacity(results.len());
        for (agent_id, result) in results {
            match result {
                Ok(content) => statements.push(AgentStatement {
                    agent_id: agent_id.clone(),
                    phase,
                    content,
                    made_at: Utc::now(),
                }),
                Err(e) => {
                    warn!(agent_id = %agent_id, phase = phase.as_str(), error = %e, "statement failed")
                }
            }
        }

        for statement in &statements {
            let message =
                phases::statement_message(round, &statement.agent_id, phase, &statement.content);
            self.publish_quietly(&message).await;
        }
        round.statements.extend(statements);
    }

    async fn collect_votes(&self, round: &mut DebateRound) {
        let contracts = self.contracts(&round.participants).await;
        let snapshot: &DebateRound = round;
        let results = join_all(
            contracts
                .iter()
                .map(|(id, contract)| async move { (id, contract.vote(snapshot).await) }),
        )
        .await;

        for (agent_id, result) in results {
            match result {
                Ok(vote) => {
                    if let Some(vote) = accept_vote(round, agent_id, vote) {
                        self.publish_quietly(&phases::vote_message(round, &vote)).await;
                        round.votes.push(vote);
                    }
                }
                Err(e) => warn!(agent_id = %agent_id, error = %e, "vote failed"),
            }
        }
    }

    async fn publish_quietly(&self, message: &SwarmMessage) {
        if let Err(e) = self.bus.publish(message).await {
            warn!(message_id = %message.id, thread_id = %message.thread_id, error = %e, "debate publish failed");
        }
    }

    /// Close an active debate, record participant statistics and move the
    /// round to history. Fails with `DebateNotFound` on a second call.
    pub async fn finalize_debate(&self, debate_id: &DebateId) -> SwarmResult<DebateRound> {
        self.close(debate_id, DebateStatus::Finalized, Utc::now())
            .await
    }

    async fn close(
        &self,
        debate_id: &DebateId,
        status: DebateStatus,
        now: DateTime<Utc>,
    ) -> SwarmResult<DebateRound> {
        let round = self
            .active
            .write()
            .await
            .remove(debate_id)
            .ok_or_else(|| SwarmError::DebateNotFound(debate_id.clone()))?;

        // Waits out a phase that is still running.
        let round = {
            let mut guard = round.lock().await;
            guard.status = status;
            guard.finished_at = Some(now);
            guard.clone()
        };

        if status == DebateStatus::Finalized {
            self.record_participation(&round).await;
        }

        let consensus_reached = round.outcome.as_ref().is_some_and(|o| o.consensus_reached);
        METRICS.inc_debates_finalized();
        obs::emit_debate_finalized(
            debate_id,
            consensus_reached,
            status == DebateStatus::Expired,
        );

        self.history
            .write()
            .await
            .insert(debate_id.clone(), round.clone());
        Ok(round)
    }

    async fn record_participation(&self, round: &DebateRound) {
        let reached = round.outcome.as_ref().map(|o| o.consensus_reached);
        let mut participants = self.participants.write().await;
        for agent_id in &round.participants {
            let Some(participant) = participants.get_mut(agent_id) else {
                continue;
            };
            let profile = &mut participant.profile;
            profile.debates_participated += 1;

            let approved = round
                .vote_of(agent_id)
                .map(|v| v.vote == VoteDecision::Approve);
            if let (Some(reached), Some(approved)) = (reached, approved) {
                if approved == reached {
                    profile.debates_agreed += 1;
                }
            }
        }
    }

    /// Current round of an active debate, else the archived one.
    pub async fn debate_status(&self, debate_id: &DebateId) -> Option<DebateRound> {
        let active = self.active.read().await.get(debate_id).cloned();
        if let Some(round) = active {
            return Some(round.lock().await.clone());
        }
        self.history.read().await.get(debate_id).cloned()
    }

    pub async fn active_debates(&self) -> Vec<DebateId> {
        self.active.read().await.keys().cloned().collect()
    }

    // -- monitor ----------------------------------------------------------------

    /// Expire every active debate started more than `debate_timeout_secs` before `now`.
    pub async fn expire_stale_at(&self, now: DateTime<Utc>) -> Vec<DebateId> {
        let timeout = chrono::Duration::seconds(self.config.debate_timeout_secs as i64);
        let rounds: Vec<(DebateId, Arc<Mutex<DebateRound>>)> = self
            .active
            .read()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), Arc::clone(r)))
            .collect();

        let mut stale = Vec::new();
        for (id, round) in rounds {
            let started_at = round.lock().await.started_at;
            if now - started_at > timeout {
                stale.push(id);
            }
        }

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            match self.close(&id, DebateStatus::Expired, now).await {
                Ok(_) => expired.push(id),
                Err(e) => debug!(debate_id = %id, error = %e, "debate closed concurrently"),
            }
        }
        expired
    }

    /// Spawn the periodic expiry of stale debates.
    pub fn spawn_monitor_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.monitor_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                let expired = engine.expire_stale_at(Utc::now()).await;
                if !expired.is_empty() {
                    info!(count = expired.len(), "stale debates expired");
                }
            }
            debug!("debate monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, DirectoryConfig};
    use crate::domain::AgentVote;
    use crate::scheduler::HookError;
    use async_trait::async_trait;
    use swarm_transport::MemoryStreamStore;

    struct Yes;

    #[async_trait]
    impl DebateParticipant for Yes {
        async fn statement(&self, _round: &DebateRound, phase: DebatePhase) -> Result<String, HookError> {
            Ok(format!("in favour ({})", phase.as_str()))
        }

        async fn vote(&self, _round: &DebateRound) -> Result<AgentVote, HookError> {
            Err("abstaining by silence".into())
        }
    }

    fn engine(timeout_secs: u64) -> ConsensusEngine {
        let bus = Arc::new(MessageBus::new(
            Arc::new(MemoryStreamStore::new()),
            BusConfig::default(),
        ));
        let directory = Arc::new(AgentDirectory::new(DirectoryConfig::default()));
        ConsensusEngine::new(
            directory,
            bus,
            ConsensusConfig {
                debate_timeout_secs: timeout_secs,
                ..ConsensusConfig::default()
            },
        )
    }

    async fn register(engine: &ConsensusEngine, id: &str) {
        engine
            .register_participant(
                AgentId::from(id),
                Default::default(),
                HashMap::new(),
                Arc::new(Yes),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_participant_rejected() {
        let e = engine(60);
        register(&e, "a").await;
        let err = e
            .register_participant(AgentId::from("a"), Default::default(), HashMap::new(), Arc::new(Yes))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::DuplicateAgent(_)));
    }

    #[tokio::test]
    async fn failed_votes_leave_no_consensus() {
        let e = engine(60);
        register(&e, "a").await;
        register(&e, "b").await;
        let id = e
            .initiate_debate(DebateProposal::new("p", "d", "a"), &[], 1)
            .await
            .unwrap();

        let round = e.advance_round(&id, DebatePhase::OpeningStatements).await.unwrap();
        assert_eq!(round.statements_in(DebatePhase::OpeningStatements).count(), 2);

        e.advance_round(&id, DebatePhase::Voting).await.unwrap();
        let round = e.advance_round(&id, DebatePhase::Consensus).await.unwrap();
        let outcome = round.outcome.unwrap();
        assert_eq!(outcome.total_votes, 0);
        assert!(!outcome.consensus_reached);
        assert_eq!(round.phase_timings.len(), 3);
    }

    #[tokio::test]
    async fn stale_debates_expire() {
        let e = engine(60);
        register(&e, "a").await;
        let id = e
            .initiate_debate(DebateProposal::new("p", "d", "a"), &[], 1)
            .await
            .unwrap();

        assert!(e.expire_stale_at(Utc::now()).await.is_empty());
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(e.expire_stale_at(later).await, vec![id.clone()]);

        let round = e.debate_status(&id).await.unwrap();
        assert_eq!(round.status, DebateStatus::Expired);
        assert!(e.active_debates().await.is_empty());
        // Expiry is not participation.
        assert_eq!(e.participant(&AgentId::from("a")).await.unwrap().debates_participated, 0);
    }

    #[tokio::test]
    async fn round_closed_while_waiting_is_not_advanced() {
        let e = engine(60);
        register(&e, "a").await;
        let id = e
            .initiate_debate(DebateProposal::new("p", "d", "a"), &[], 1)
            .await
            .unwrap();

        // A caller that looked the round up before finalize removed it.
        let held = e.active_round(&id).await.unwrap();
        let finalized = e.finalize_debate(&id).await.unwrap();

        let err = e
            .advance(&held, &id, DebatePhase::OpeningStatements)
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::DebateNotFound(_)));
        assert!(held.lock().await.statements.is_empty());
        assert_eq!(e.debate_status(&id).await.unwrap(), finalized);
    }
}
