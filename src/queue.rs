//! Priority queue over the non-terminal tasks of a registry.
//!
//! Scores are computed at read time from `now` and never cached, since the
//! recency and novelty terms decay continuously.

use chrono::{DateTime, Utc};

use crate::config::ScoringConfig;
use crate::registry::TaskRegistry;
use crate::scorer::{self, ScoreBreakdown};
use crate::task::Task;

/// A task with its score at ranking time.
#[derive(Debug, Clone)]
pub struct RankedTask {
    pub task: Task,
    pub score: ScoreBreakdown,
    /// Waiting on an incomplete dependency; skipped by `peek_best`.
    pub dependency_blocked: bool,
}

/// Read-only ranking view.
pub struct PriorityQueue<'a> {
    registry: &'a TaskRegistry,
    scoring: &'a ScoringConfig,
}

impl<'a> PriorityQueue<'a> {
    pub fn new(registry: &'a TaskRegistry, scoring: &'a ScoringConfig) -> Self {
        Self { registry, scoring }
    }

    fn scored(&self, now: DateTime<Utc>) -> Vec<(&'a Task, f64)> {
        let mut scored: Vec<_> = self
            .registry
            .live()
            .map(|t| (t, scorer::score(t, now, self.scoring)))
            .collect();
        scored.sort_by(|a, b| scorer::rank_order(*a, *b));
        scored
    }

    /// Highest-scored task that is not waiting on a dependency.
    pub fn peek_best(&self, now: DateTime<Utc>) -> Option<&'a Task> {
        self.scored(now)
            .into_iter()
            .map(|(t, _)| t)
            .find(|t| !self.registry.is_dependency_blocked(t))
    }

    /// Every non-terminal task, best first.
    pub fn all_ranked(&self, now: DateTime<Utc>) -> Vec<RankedTask> {
        self.scored(now)
            .into_iter()
            .map(|(t, _)| RankedTask {
                task: t.clone(),
                score: scorer::breakdown(t, now, self.scoring),
                dependency_blocked: self.registry.is_dependency_blocked(t),
            })
            .collect()
    }

    /// Number of tasks in the queue.
    pub fn len(&self) -> usize {
        self.registry.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
