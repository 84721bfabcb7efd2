//! Pure scoring and health arithmetic for the directory.

use std::collections::{BTreeSet, HashSet};

use crate::domain::{Agent, AgentId, Capability};

const LOAD_WEIGHT: f64 = 0.4;
const HEALTH_WEIGHT: f64 = 0.4;
const SPEED_WEIGHT: f64 = 0.2;

/// Weight of the previous value in exponential smoothing.
const SMOOTHING_KEEP: f64 = 0.8;
const HEALTH_TARGET_FLOOR: f64 = 0.1;

/// Multiplier applied when an agent's health cannot be evaluated.
pub const EVALUATION_ERROR_DECAY: f64 = 0.9;

/// `0.4·(1 − load) + 0.4·health + 0.2·(1 / (1 + avg_processing_time))`
pub fn selection_score(agent: &Agent) -> f64 {
    LOAD_WEIGHT * (1.0 - agent.load_factor())
        + HEALTH_WEIGHT * agent.health_score
        + SPEED_WEIGHT * (1.0 / (1.0 + agent.average_processing_time.max(0.0)))
}

/// Highest-scoring available agent holding every required capability.
///
/// `agents` must iterate in a stable order; on equal scores the first one
/// seen wins.
pub fn best_candidate<'a>(
    agents: impl IntoIterator<Item = &'a Agent>,
    required: &BTreeSet<Capability>,
    exclude: &HashSet<AgentId>,
) -> Option<&'a Agent> {
    let mut best: Option<(&Agent, f64)> = None;
    for agent in agents {
        if !agent.is_available()
            || !agent.has_capabilities(required)
            || exclude.contains(&agent.agent_id)
        {
            continue;
        }
        let score = selection_score(agent);
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((agent, score)),
        }
    }
    best.map(|(agent, _)| agent)
}

/// `max(0.1, 1 − error_rate)`, halved when not ready.
///
/// `None` when the error rate is not a number in `[0, 1]`.
pub fn target_health(error_rate: f64, is_ready: bool) -> Option<f64> {
    if !(0.0..=1.0).contains(&error_rate) {
        return None;
    }
    let target = (1.0 - error_rate).max(HEALTH_TARGET_FLOOR);
    Some(if is_ready { target } else { target / 2.0 })
}

/// Exponential smoothing shared by health and processing time.
pub fn smooth(old: f64, new: f64) -> f64 {
    SMOOTHING_KEEP * old + (1.0 - SMOOTHING_KEEP) * new
}

/// Next health score for an evaluation; degrades on an invalid error rate.
pub fn next_health(old: f64, error_rate: f64, is_ready: bool) -> f64 {
    let next = match target_health(error_rate, is_ready) {
        Some(target) => smooth(old, target),
        None => old * EVALUATION_ERROR_DECAY,
    };
    next.clamp(0.0, 1.0)
}
