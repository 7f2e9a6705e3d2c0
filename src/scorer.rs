//! Priority scoring.
//!
//! `score` is a pure function of a task, the scoring configuration and an
//! explicit `now`. Nothing here reads the clock.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ScoringConfig;
use crate::task::Task;

const SECS_PER_HOUR: f64 = 3600.0;
const SECS_PER_DAY: f64 = 86_400.0;

/// Per-factor sub-scores, each in [0, 1], plus the weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub urgency: f64,
    pub recency: f64,
    pub value: f64,
    pub novelty: f64,
    pub user_signal: f64,
    pub error_boost: f64,
    pub total: f64,
}

/// `0.5^(elapsed/half_life)`; elapsed time before `since` counts as zero.
pub fn half_life_decay(elapsed_secs: f64, half_life_secs: f64) -> f64 {
    if half_life_secs <= 0.0 {
        return 0.0;
    }
    let elapsed = elapsed_secs.max(0.0);
    0.5_f64.powf(elapsed / half_life_secs)
}

fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds() as f64 / 1000.0
}

fn unit(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

/// Urgency from the supplied rating and the deadline, whichever is higher.
pub fn urgency(task: &Task, now: DateTime<Utc>, config: &ScoringConfig) -> f64 {
    let supplied = task.urgency.map(unit).unwrap_or(0.0);
    let derived = match task.deadline {
        Some(deadline) if deadline <= now => 1.0,
        Some(deadline) => half_life_decay(
            elapsed_secs(now, deadline),
            config.deadline_half_life_hours * SECS_PER_HOUR,
        ),
        None => 0.0,
    };
    unit(supplied.max(derived))
}

/// Break a task's score into its weighted factors.
pub fn breakdown(task: &Task, now: DateTime<Utc>, config: &ScoringConfig) -> ScoreBreakdown {
    let urgency = urgency(task, now, config);
    let recency = unit(half_life_decay(
        elapsed_secs(task.last_touched_at, now),
        config.recency_half_life_hours * SECS_PER_HOUR,
    ));
    let value = unit(task.value);
    let novelty = unit(half_life_decay(
        elapsed_secs(task.created_at, now),
        config.novelty_half_life_days * SECS_PER_DAY,
    ));
    let user_signal = unit((task.priority_signal + 1.0) / 2.0);
    let error_boost = if config.error_cap == 0 {
        0.0
    } else {
        unit(task.error_count.min(config.error_cap) as f64 / config.error_cap as f64)
    };

    let w = &config.weights;
    let total_weight = w.total();
    let weighted = w.urgency.max(0.0) * urgency
        + w.recency.max(0.0) * recency
        + w.value.max(0.0) * value
        + w.novelty.max(0.0) * novelty
        + w.user_signal.max(0.0) * user_signal
        + w.error_boost.max(0.0) * error_boost;
    let total = if total_weight > 0.0 { unit(weighted / total_weight) } else { 0.0 };

    ScoreBreakdown {
        urgency,
        recency,
        value,
        novelty,
        user_signal,
        error_boost,
        total,
    }
}

/// Priority score in [0, 1].
pub fn score(task: &Task, now: DateTime<Utc>, config: &ScoringConfig) -> f64 {
    breakdown(task, now, config).total
}

/// Ranking order: higher score first, then older task, then id.
pub fn rank_order(a: (&Task, f64), b: (&Task, f64)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.created_at.cmp(&b.0.created_at))
        .then_with(|| a.0.id.cmp(&b.0.id))
}
