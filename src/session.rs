//! Session boundary signals.
//!
//! A session starts with a briefing of where things stand, ends with
//! consolidation plus a checkpoint, and may be cut short by context
//! pressure, which checkpoints immediately.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checkpoint::{CheckpointReason, CheckpointSummary};
use crate::consolidation::ConsolidationReport;
use crate::controller::LifecycleController;
use crate::error::Result;
use crate::pool::PoolEntry;
use crate::queue::RankedTask;
use crate::registry::TaskCounts;
use crate::task::{Task, TaskId};

/// What a new session needs to know.
#[derive(Debug, Clone)]
pub struct Briefing {
    pub generated_at: DateTime<Utc>,
    pub active: Option<Task>,
    /// Best candidate that is not waiting on a dependency.
    pub next: Option<TaskId>,
    pub ranked: Vec<RankedTask>,
    pub pool: Vec<PoolEntry>,
    pub counts: TaskCounts,
    pub pending_consolidation: usize,
    pub latest_checkpoint: Option<CheckpointSummary>,
    /// Tasks demoted because more than one was ACTIVE.
    pub repaired: Vec<TaskId>,
}

/// What `on_session_end` did.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEnd {
    pub consolidation: ConsolidationReport,
    pub checkpoint: CheckpointSummary,
}

impl LifecycleController {
    /// Re-check invariants and summarise the current state.
    pub async fn on_session_start(&mut self) -> Result<Briefing> {
        let repaired = self.check_invariants().await?;
        let now = self.now();
        let queue = self.queue();

        Ok(Briefing {
            generated_at: now,
            active: self.active().cloned(),
            next: queue.peek_best(now).map(|t| t.id.clone()),
            ranked: queue.all_ranked(now),
            pool: self.pool().entries().to_vec(),
            counts: self.registry().counts(),
            pending_consolidation: self.pending_consolidation(),
            latest_checkpoint: self.latest_checkpoint().await?,
            repaired,
        })
    }

    /// Consolidate completed work, then checkpoint.
    ///
    /// The checkpoint is written even when consolidation could not be saved.
    pub async fn on_session_end(&mut self) -> Result<SessionEnd> {
        let consolidation = match self.consolidate().await {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Consolidation at session end not saved: {}", e);
                ConsolidationReport::default()
            }
        };
        let checkpoint = self.checkpoint(CheckpointReason::SessionEnd).await?;
        log::info!(
            "Session ended: {} decisions and {} summaries exported, checkpoint {}",
            consolidation.decisions_exported(),
            consolidation.summaries_exported(),
            checkpoint.id
        );
        Ok(SessionEnd {
            consolidation,
            checkpoint,
        })
    }

    /// Checkpoint now, before the working context is lost.
    pub async fn on_context_pressure(&mut self) -> Result<CheckpointSummary> {
        log::info!("Context pressure signalled; checkpointing");
        self.checkpoint(CheckpointReason::ContextPressure).await
    }
}
