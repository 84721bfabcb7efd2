//! End-to-end: tasks, messaging and a debate through one coordinator over
//! the SurrealDB-backed stream store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use swarm_core::{
    capabilities, Agent, AgentId, AgentVote, DebateParticipant, DebatePhase, DebateProposal,
    DebateRound, ExecutionReport, FnExecutor, HookError, MessageType, SubscriptionFilter,
    SwarmConfig, SwarmCoordinator, SwarmError, SwarmMessage, Task, TaskExecutor, TaskId,
    TaskStatus, VoteDecision,
};
use swarm_transport::SurrealStreamStore;

struct Approver(AgentId);

#[async_trait]
impl DebateParticipant for Approver {
    async fn statement(&self, _round: &DebateRound, phase: DebatePhase) -> Result<String, HookError> {
        Ok(format!("{} supports it ({})", self.0, phase.as_str()))
    }

    async fn vote(&self, round: &DebateRound) -> Result<AgentVote, HookError> {
        Ok(AgentVote {
            agent_id: self.0.clone(),
            proposal_id: round.proposal.id.clone(),
            vote: VoteDecision::Approve,
            reasoning: "low risk".into(),
            confidence: 0.9,
        })
    }
}

fn doubler() -> Arc<dyn TaskExecutor> {
    Arc::new(FnExecutor::new(|_id: TaskId, payload: serde_json::Value| {
        let n = payload["n"].as_i64().unwrap_or_default();
        std::future::ready(ExecutionReport::success(serde_json::json!({ "doubled": n * 2 })))
    }))
}

async fn coordinator() -> anyhow::Result<SwarmCoordinator> {
    let mut config = SwarmConfig::default();
    config.scheduler.poll_interval_ms = 5;
    config.bus.poll_wait_ms = 50;
    let store = Arc::new(SurrealStreamStore::in_memory().await?);
    Ok(SwarmCoordinator::new(config, store)?)
}

async fn wait_until_done(c: &SwarmCoordinator, id: &TaskId) -> anyhow::Result<Task> {
    for _ in 0..400 {
        if let Some(task) = c.scheduler().get_status(id).await {
            if task.status.is_terminal() {
                return Ok(task);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    anyhow::bail!("task {id} did not finish")
}

#[tokio::test]
async fn test_tasks_flow_through_registered_agents() -> anyhow::Result<()> {
    let c = coordinator().await?;
    for id in ["worker-1", "worker-2"] {
        c.register_agent(
            Agent::new(id, id, "math", capabilities(["arithmetic"]), 2),
            doubler(),
        )
        .await?;
    }
    c.start().await;

    let mut ids = Vec::new();
    for n in 0..6 {
        let task = Task::new("double", serde_json::json!({ "n": n }))
            .with_capabilities(capabilities(["arithmetic"]));
        ids.push(c.submit_task(task).await?);
    }
    for (n, id) in ids.iter().enumerate() {
        let task = wait_until_done(&c, id).await?;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap()["doubled"], (n as i64) * 2);
    }

    let status = c.status().await;
    assert_eq!(status.scheduler.completed, 6);
    assert_eq!(status.directory.total_agents, 2);
    assert!(status.scheduler.per_agent_load.values().all(|l| l.current == 0));

    c.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_messages_reach_subscribers_and_debate_concludes() -> anyhow::Result<()> {
    let c = coordinator().await?;
    c.start().await;

    let reviewer = AgentId::from("reviewer");
    let mut sub = c
        .bus()
        .subscribe(&reviewer, SubscriptionFilter::types([MessageType::Query]))
        .await?;
    c.bus()
        .publish(
            &SwarmMessage::new("planner", MessageType::Query, serde_json::json!({ "ask": "status" }))
                .to("reviewer"),
        )
        .await?;
    let delivery = tokio::time::timeout(Duration::from_secs(5), sub.next()).await??;
    assert_eq!(delivery.message.content["ask"], "status");
    sub.ack(&delivery).await?;

    for id in ["alpha", "beta", "gamma"] {
        let agent_id = AgentId::from(id);
        c.consensus()
            .register_participant(
                agent_id.clone(),
                capabilities(["review"]),
                HashMap::from([("ops".to_string(), 0.7)]),
                Arc::new(Approver(agent_id)),
            )
            .await?;
    }

    let debate = c
        .consensus()
        .initiate_debate(
            DebateProposal::new("Enable canary", "Ship to 5% first", "planner"),
            &["ops".to_string()],
            2,
        )
        .await?;
    assert_eq!(c.status().await.active_debates, 1);

    let mut phase = DebatePhase::Initialization;
    while let Some(next) = phase.next() {
        c.consensus().advance_round(&debate, next).await?;
        phase = next;
    }
    let round = c.consensus().finalize_debate(&debate).await?;
    let outcome = round.outcome.expect("consensus phase ran");
    assert!(outcome.consensus_reached);
    assert_eq!(outcome.total_votes, 3);

    let history = c.bus().get_thread_history(debate.as_str(), 200).await?;
    assert!(history
        .iter()
        .any(|m| m.content["event"] == "consensus_reached"));

    c.shutdown().await;
    assert!(matches!(
        c.bus().publish(&SwarmMessage::new("x", MessageType::Event, serde_json::Value::Null)).await,
        Err(SwarmError::TransportClosed)
    ));
    Ok(())
}
