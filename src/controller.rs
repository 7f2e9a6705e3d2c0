//! Lifecycle controller.
//!
//! The only component that changes task status, the ACTIVE pointer or the
//! pool. Every operation mutates a copy of the in-memory state, commits the
//! touched records and the state row in one store write, and swaps the copy
//! in only once the write succeeded.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, CheckpointReason, CheckpointStore, CheckpointSummary};
use crate::config::{CheckpointSettings, Config, PoolSettings, SchedulerSettings, ScoringConfig};
use crate::consolidation::{ConsolidationReport, Consolidator, TaskExport};
use crate::error::{Error, ErrorKind, Result};
use crate::pool::{Admission, WorkingMemoryPool};
use crate::queue::{PriorityQueue, RankedTask};
use crate::registry::TaskRegistry;
use crate::store::{ControllerState, TaskStore, WriteBatch};
use crate::task::{DEFAULT_VALUE, Decision, Note, Task, TaskEventKind, TaskId, TaskStatus};

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Everything the controller needs from the configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerSettings {
    pub scheduler: SchedulerSettings,
    pub pool: PoolSettings,
    pub scoring: ScoringConfig,
    pub checkpoint: CheckpointSettings,
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            scheduler: config.scheduler.clone(),
            pool: config.pool.clone(),
            scoring: config.scoring.clone(),
            checkpoint: config.checkpoint.clone(),
        }
    }
}

/// Parameters for a new task.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub title: String,
    /// Ask for the new task to become ACTIVE.
    pub activate: bool,
    pub priority_signal: f64,
    pub urgency: Option<f64>,
    pub deadline: Option<DateTime<Utc>>,
    pub value: Option<f64>,
    pub context_size: u64,
    /// Start BLOCKED on these tasks.
    pub blocked_by: Vec<TaskId>,
}

impl SpawnRequest {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_activation(mut self) -> Self {
        self.activate = true;
        self
    }

    pub fn with_priority_signal(mut self, signal: f64) -> Self {
        self.priority_signal = signal;
        self
    }

    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = Some(urgency);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_context_size(mut self, size: u64) -> Self {
        self.context_size = size;
        self
    }

    pub fn blocked_by(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.blocked_by = ids.into_iter().collect();
        self
    }
}

/// Result of `complete`.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task: Task,
    /// Dependents moved from BLOCKED to PAUSED.
    pub unblocked: Vec<TaskId>,
    /// Consolidation outcome, if a consolidator is configured.
    pub export: Option<TaskExport>,
}

fn unit(x: f64) -> Option<f64> {
    x.is_finite().then(|| x.clamp(0.0, 1.0))
}

#[derive(Debug, Clone)]
struct Snapshot {
    registry: TaskRegistry,
    pool: WorkingMemoryPool,
    state: ControllerState,
}

/// A working copy of the controller state.
struct Txn {
    snap: Snapshot,
    dirty: BTreeSet<TaskId>,
    now: DateTime<Utc>,
}

impl Txn {
    fn task(&self, id: &TaskId) -> Result<&Task> {
        self.snap.registry.require(id)
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let task = self.snap.registry.require_mut(id)?;
        self.dirty.insert(id.clone());
        Ok(task)
    }

    /// Mutable access to a non-terminal task.
    fn live_task_mut(&mut self, id: &TaskId, action: &'static str) -> Result<&mut Task> {
        let status = self.task(id)?.status;
        if status.is_terminal() {
            return Err(Error::InvalidTransition {
                id: id.clone(),
                from: status,
                action,
            });
        }
        self.task_mut(id)
    }

    /// Move `id` to `to` if the status machine allows it.
    fn set_status(&mut self, id: &TaskId, to: TaskStatus, action: &'static str) -> Result<&mut Task> {
        let task = self.task_mut(id)?;
        if !task.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: id.clone(),
                from: task.status,
                action,
            });
        }
        task.status = to;
        Ok(task)
    }

    /// Admit `id` to the pool as an access.
    fn admit(&mut self, id: &TaskId) -> Result<Admission> {
        let active = self.snap.state.active.clone();
        let task = self.snap.registry.require(id)?;
        Ok(self.snap.pool.admit(task, active.as_ref(), self.now))
    }

    fn is_active(&self, id: &TaskId) -> bool {
        self.snap.state.active.as_ref() == Some(id)
    }

    fn require_dependencies_met(&self, id: &TaskId) -> Result<()> {
        let blockers = self.snap.registry.open_blockers(self.task(id)?);
        if !blockers.is_empty() {
            return Err(Error::DependencyIncomplete {
                id: id.clone(),
                blockers,
            });
        }
        Ok(())
    }

    /// Make `id` ACTIVE, pausing the previous ACTIVE task.
    fn activate(&mut self, id: &TaskId) -> Result<()> {
        let now = self.now;
        if let Some(prev) = self.snap.state.active.clone()
            && &prev != id
            && self.snap.registry.get(&prev).is_some_and(|t| t.status == TaskStatus::Active)
        {
            self.set_status(&prev, TaskStatus::Paused, "pause")?
                .record(TaskEventKind::Paused, now);
        }

        let was_blocked = self.task(id)?.status == TaskStatus::Blocked;
        let task = self.set_status(id, TaskStatus::Active, "activate")?;
        if was_blocked {
            task.record(TaskEventKind::Unblocked, now);
        }
        task.activated_at = Some(now);
        task.record(TaskEventKind::Activated, now);
        self.snap.state.active = Some(id.clone());

        let task = self.snap.registry.require(id)?;
        let admission = self.snap.pool.admit(task, Some(id), now);
        if !admission.evicted().is_empty() {
            log::debug!("Activating {} evicted {:?} from the pool", id, admission.evicted());
        }
        Ok(())
    }

    /// Clear the ACTIVE pointer if it points at `id`.
    fn release_active(&mut self, id: &TaskId) {
        if self.is_active(id) {
            self.snap.state.active = None;
        }
    }

    /// Demote all but the most recently activated ACTIVE task and fix the pointer.
    fn repair_active(&mut self) -> Result<Vec<TaskId>> {
        let now = self.now;
        let mut actives = self.snap.registry.with_status(TaskStatus::Active);
        actives.sort_by(|a, b| {
            b.activated_at
                .cmp(&a.activated_at)
                .then_with(|| b.last_touched_at.cmp(&a.last_touched_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let keep = actives.first().map(|t| t.id.clone());
        let demote: Vec<TaskId> = actives.iter().skip(1).map(|t| t.id.clone()).collect();

        for id in &demote {
            self.set_status(id, TaskStatus::Paused, "demote")?
                .record(TaskEventKind::Demoted, now);
        }
        if !demote.is_empty() {
            log::warn!(
                "Found {} ACTIVE tasks; kept {:?}, demoted {:?}",
                demote.len() + 1,
                keep,
                demote
            );
        }

        if self.snap.state.active != keep {
            log::warn!("ACTIVE pointer was {:?}, repaired to {:?}", self.snap.state.active, keep);
            self.snap.state.active = keep.clone();
        }
        if let Some(id) = &keep
            && !self.snap.pool.contains(id)
        {
            let task = self.snap.registry.require(id)?;
            self.snap.pool.admit(task, Some(id), now);
        }
        Ok(demote)
    }
}

/// Owner of the registry, the pool and the ACTIVE pointer.
pub struct LifecycleController {
    store: Arc<dyn TaskStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    consolidator: Option<Consolidator>,
    settings: ControllerSettings,
    clock: Clock,
    snapshot: Snapshot,
}

impl LifecycleController {
    /// Open the controller on the wall clock.
    pub async fn open(
        store: Arc<dyn TaskStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: ControllerSettings,
    ) -> Result<Self> {
        Self::open_with_clock(store, checkpoints, settings, system_clock()).await
    }

    /// Open the controller, loading durable state.
    ///
    /// Falls back to the latest checkpoint when the store is empty or
    /// unreadable, then repairs the single-ACTIVE invariant.
    pub async fn open_with_clock(
        store: Arc<dyn TaskStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: ControllerSettings,
        clock: Clock,
    ) -> Result<Self> {
        let snapshot = Snapshot {
            registry: TaskRegistry::new(),
            pool: WorkingMemoryPool::new(settings.pool.clone()),
            state: ControllerState::default(),
        };
        let mut controller = Self {
            store,
            checkpoints,
            consolidator: None,
            settings,
            clock,
            snapshot,
        };

        match controller.reload().await {
            Ok(()) if !controller.snapshot.registry.is_empty() || controller.snapshot.state.version > 0 => {}
            Ok(()) => {
                if let Some(checkpoint) = controller.checkpoints.latest().await? {
                    log::warn!("Task store is empty; restoring checkpoint {}", checkpoint.id);
                    controller.restore_checkpoint(&checkpoint).await?;
                }
            }
            Err(e) if e.kind() == ErrorKind::PersistenceFailure => {
                log::warn!("Task store unreadable: {}", e);
                match controller.checkpoints.latest().await? {
                    Some(checkpoint) => controller.restore_checkpoint(&checkpoint).await?,
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        controller.check_invariants().await?;
        Ok(controller)
    }

    /// Attach the consolidation sinks used by `complete` and `consolidate`.
    pub fn with_consolidator(mut self, consolidator: Consolidator) -> Self {
        self.consolidator = Some(consolidator);
        self
    }

    /// Re-read the durable state, discarding the in-memory copy.
    pub async fn reload(&mut self) -> Result<()> {
        let (tasks, state) = self.store.load_snapshot().await?;
        let state = state.unwrap_or_default();
        let registry = TaskRegistry::from_tasks(tasks);
        let pool = WorkingMemoryPool::restore(self.settings.pool.clone(), state.pool.clone(), &registry);
        self.snapshot = Snapshot { registry, pool, state };
        Ok(())
    }

    // === Accessors ===

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.snapshot.registry
    }

    pub fn get(&self, id: &TaskId) -> Result<&Task> {
        self.snapshot.registry.require(id)
    }

    pub fn active_id(&self) -> Option<&TaskId> {
        self.snapshot.state.active.as_ref()
    }

    /// The ACTIVE task, if any.
    pub fn active(&self) -> Option<&Task> {
        self.active_id().and_then(|id| self.snapshot.registry.get(id))
    }

    pub fn pool(&self) -> &WorkingMemoryPool {
        &self.snapshot.pool
    }

    /// The durable state row as last committed.
    pub fn state(&self) -> &ControllerState {
        &self.snapshot.state
    }

    pub fn queue(&self) -> PriorityQueue<'_> {
        PriorityQueue::new(&self.snapshot.registry, &self.settings.scoring)
    }

    /// Every non-terminal task, best first, scored now.
    pub fn ranked(&self) -> Vec<RankedTask> {
        self.queue().all_ranked(self.now())
    }

    /// The task that deserves attention next.
    pub fn next(&self) -> Option<&Task> {
        self.queue().peek_best(self.now())
    }

    /// Completed tasks waiting for consolidation.
    pub fn pending_consolidation(&self) -> usize {
        Consolidator::pending(&self.snapshot.registry).len()
    }

    pub async fn latest_checkpoint(&self) -> Result<Option<CheckpointSummary>> {
        Ok(self.checkpoints.latest().await?.as_ref().map(CheckpointSummary::from))
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>> {
        self.checkpoints.list().await
    }

    // === Transactions ===

    fn begin(&self) -> Txn {
        Txn {
            snap: self.snapshot.clone(),
            dirty: BTreeSet::new(),
            now: self.now(),
        }
    }

    /// Write the working copy and swap it in. On failure nothing changes.
    async fn commit(&mut self, txn: Txn, transitions: u32) -> Result<()> {
        let Txn { mut snap, dirty, .. } = txn;

        let mut tasks = Vec::with_capacity(dirty.len());
        for id in &dirty {
            let task = snap.registry.require_mut(id)?;
            task.version += 1;
            tasks.push(task.clone());
        }
        snap.state.pool = snap.pool.entries().to_vec();
        snap.state.transitions_since_checkpoint = snap.state.transitions_since_checkpoint.saturating_add(transitions);
        snap.state.version += 1;

        let batch = WriteBatch {
            tasks,
            state: Some(snap.state.clone()),
        };
        if let Err(e) = self.store.commit(&batch).await {
            log::warn!("Commit failed, in-memory state left unchanged: {}", e);
            return Err(e);
        }
        self.snapshot = snap;
        Ok(())
    }

    async fn apply<T>(&mut self, transitions: u32, f: impl FnOnce(&mut Txn) -> Result<T>) -> Result<T> {
        let mut txn = self.begin();
        let out = f(&mut txn)?;
        self.commit(txn, transitions).await?;
        Ok(out)
    }

    /// Apply a lifecycle transition, then write a periodic checkpoint if one is due.
    async fn transition<T>(&mut self, f: impl FnOnce(&mut Txn) -> Result<T>) -> Result<T> {
        let out = self.apply(1, f).await?;
        self.checkpoint_if_due().await?;
        Ok(out)
    }

    async fn checkpoint_if_due(&mut self) -> Result<()> {
        let every = self.settings.checkpoint.every_transitions;
        if every == 0 || self.snapshot.state.transitions_since_checkpoint < every {
            return Ok(());
        }
        match self.checkpoint(CheckpointReason::Periodic).await {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Periodic checkpoint failed: {}", e);
                Err(Error::CheckpointFailed(e.to_string()))
            }
        }
    }

    // === Lifecycle ===

    /// Create a task. It becomes ACTIVE only when activation is requested
    /// (or configured) and either nothing is ACTIVE or preemption is on.
    pub async fn spawn(&mut self, request: SpawnRequest) -> Result<Task> {
        let scheduler = self.settings.scheduler.clone();
        let id = self
            .transition(move |txn| {
                let now = txn.now;
                let mut task = Task::new(request.title.trim(), now);
                task.priority_signal = if request.priority_signal.is_finite() {
                    request.priority_signal.clamp(-1.0, 1.0)
                } else {
                    0.0
                };
                task.urgency = request.urgency.and_then(unit);
                task.deadline = request.deadline;
                task.value = request.value.and_then(unit).unwrap_or(DEFAULT_VALUE);
                task.context_size = request.context_size;

                for dep in &request.blocked_by {
                    txn.task(dep)?;
                }
                let blocked = !request.blocked_by.is_empty();
                if blocked {
                    task.blocked_by = request.blocked_by.iter().cloned().collect();
                    task.status = TaskStatus::Blocked;
                    task.record(
                        TaskEventKind::Blocked {
                            by: request.blocked_by.clone(),
                        },
                        now,
                    );
                }

                let id = task.id.clone();
                txn.snap.registry.insert(task)?;
                txn.dirty.insert(id.clone());

                let wants_active = request.activate || scheduler.auto_activate_on_spawn;
                if wants_active && !blocked && (txn.snap.state.active.is_none() || scheduler.preempt_on_spawn) {
                    txn.activate(&id)?;
                }
                Ok(id)
            })
            .await?;

        let task = self.get(&id)?.clone();
        log::info!("Spawned {} ({}) as {}", task.id, task.title, task.status);
        Ok(task)
    }

    /// Make `id` the ACTIVE task, pausing the current one.
    pub async fn switch(&mut self, id: &TaskId) -> Result<Task> {
        if self.active_id() == Some(id) {
            self.touch(id).await?;
            return Ok(self.get(id)?.clone());
        }
        self.transition(|txn| {
            txn.live_task_mut(id, "switch")?;
            txn.require_dependencies_met(id)?;
            txn.activate(id)
        })
        .await?;
        log::info!("Switched to {}", id);
        Ok(self.get(id)?.clone())
    }

    /// ACTIVE → PAUSED.
    pub async fn pause(&mut self) -> Result<Task> {
        let id = self.active_id().cloned().ok_or(Error::NoActiveTask)?;
        self.transition(|txn| {
            let now = txn.now;
            txn.set_status(&id, TaskStatus::Paused, "pause")?
                .record(TaskEventKind::Paused, now);
            txn.release_active(&id);
            Ok(())
        })
        .await?;
        log::info!("Paused {}", id);
        Ok(self.get(&id)?.clone())
    }

    /// PAUSED or BLOCKED → ACTIVE. Fails without any change while a
    /// dependency is incomplete.
    pub async fn resume(&mut self, id: &TaskId) -> Result<Task> {
        if self.active_id() == Some(id) {
            self.touch(id).await?;
            return Ok(self.get(id)?.clone());
        }
        self.transition(|txn| {
            let status = txn.task(id)?.status;
            if !matches!(status, TaskStatus::Paused | TaskStatus::Blocked) {
                return Err(Error::InvalidTransition {
                    id: id.clone(),
                    from: status,
                    action: "resume",
                });
            }
            txn.require_dependencies_met(id)?;
            txn.activate(id)
        })
        .await?;
        log::info!("Resumed {}", id);
        Ok(self.get(id)?.clone())
    }

    /// Mark `id` BLOCKED on `by`, replacing its dependency set.
    pub async fn block(&mut self, id: &TaskId, by: &[TaskId]) -> Result<Task> {
        self.transition(|txn| {
            let now = txn.now;
            txn.live_task_mut(id, "block")?;
            for dep in by {
                txn.task(dep)?;
                if dep == id || txn.snap.registry.depends_on(dep, id) {
                    return Err(Error::DependencyCycle {
                        id: id.clone(),
                        on: dep.clone(),
                    });
                }
            }

            let task = txn.set_status(id, TaskStatus::Blocked, "block")?;
            task.blocked_by = by.iter().cloned().collect();
            task.record(TaskEventKind::Blocked { by: by.to_vec() }, now);
            txn.release_active(id);
            Ok(())
        })
        .await?;
        log::info!("Blocked {} on {:?}", id, by);
        Ok(self.get(id)?.clone())
    }

    /// BLOCKED → PAUSED once every dependency is COMPLETED.
    pub async fn unblock(&mut self, id: &TaskId) -> Result<Task> {
        self.transition(|txn| {
            let now = txn.now;
            let status = txn.task(id)?.status;
            if status != TaskStatus::Blocked {
                return Err(Error::InvalidTransition {
                    id: id.clone(),
                    from: status,
                    action: "unblock",
                });
            }
            txn.require_dependencies_met(id)?;
            txn.set_status(id, TaskStatus::Paused, "unblock")?
                .record(TaskEventKind::Unblocked, now);
            Ok(())
        })
        .await?;
        log::info!("Unblocked {}", id);
        Ok(self.get(id)?.clone())
    }

    /// Finish `id`. Nothing is auto-activated; satisfied BLOCKED dependents
    /// move to PAUSED, then the task is consolidated.
    pub async fn complete(&mut self, id: &TaskId) -> Result<Completion> {
        let unblocked = self
            .apply(1, |txn| {
                let now = txn.now;
                txn.set_status(id, TaskStatus::Completed, "complete")?
                    .record(TaskEventKind::Completed, now);
                txn.snap.pool.remove(id);
                txn.release_active(id);

                let mut unblocked = Vec::new();
                for dependent in txn.snap.registry.dependents_of(id) {
                    let ready = txn
                        .snap
                        .registry
                        .get(&dependent)
                        .is_some_and(|t| t.status == TaskStatus::Blocked && !txn.snap.registry.is_dependency_blocked(t));
                    if ready {
                        txn.set_status(&dependent, TaskStatus::Paused, "unblock")?
                            .record(TaskEventKind::Unblocked, now);
                        unblocked.push(dependent);
                    }
                }
                Ok(unblocked)
            })
            .await?;
        log::info!("Completed {}; unblocked {:?}", id, unblocked);

        let export = match self.run_consolidation(std::slice::from_ref(id)).await {
            Ok(report) => report.exports.into_iter().next(),
            Err(e) => {
                log::warn!("Export of {} not saved, will retry on next consolidation: {}", id, e);
                None
            }
        };
        self.checkpoint_if_due().await?;

        Ok(Completion {
            task: self.get(id)?.clone(),
            unblocked,
            export,
        })
    }

    /// Abandon `id`. Its notes stay in the registry; nothing is exported.
    pub async fn cancel(&mut self, id: &TaskId) -> Result<Task> {
        self.transition(|txn| {
            let now = txn.now;
            txn.set_status(id, TaskStatus::Cancelled, "cancel")?
                .record(TaskEventKind::Cancelled, now);
            txn.snap.pool.remove(id);
            txn.release_active(id);
            Ok(())
        })
        .await?;
        log::info!("Cancelled {}", id);
        Ok(self.get(id)?.clone())
    }

    // === Signals ===

    /// Set the user priority signal, clamped to [-1, 1].
    pub async fn adjust_priority(&mut self, id: &TaskId, signal: f64) -> Result<Task> {
        self.apply(0, |txn| {
            let now = txn.now;
            txn.live_task_mut(id, "adjust priority of")?
                .set_priority_signal(signal, now);
            Ok(())
        })
        .await?;
        Ok(self.get(id)?.clone())
    }

    /// Count a failed work attempt. Returns the new count.
    pub async fn record_error(&mut self, id: &TaskId) -> Result<u32> {
        self.apply(0, |txn| {
            let now = txn.now;
            let count = txn.live_task_mut(id, "record an error on")?.record_error(now);
            txn.admit(id)?;
            Ok(count)
        })
        .await
    }

    /// Record an access: refreshes recency and admits the task to the pool.
    ///
    /// Errors, notes, decisions and field updates count as accesses too.
    pub async fn touch(&mut self, id: &TaskId) -> Result<Admission> {
        self.apply(0, |txn| {
            let now = txn.now;
            txn.live_task_mut(id, "touch")?.touch(now);
            txn.admit(id)
        })
        .await
    }

    /// Record a decision for later export.
    pub async fn record_decision(
        &mut self,
        id: &TaskId,
        title: &str,
        rationale: &str,
        supersedes: Option<String>,
    ) -> Result<Task> {
        self.apply(0, |txn| {
            let now = txn.now;
            let task = txn.live_task_mut(id, "record a decision on")?;
            task.decisions.push(Decision {
                title: title.to_string(),
                rationale: rationale.to_string(),
                supersedes,
                recorded_at: now,
            });
            task.record(
                TaskEventKind::DecisionRecorded {
                    title: title.to_string(),
                },
                now,
            );
            txn.admit(id)?;
            Ok(())
        })
        .await?;
        Ok(self.get(id)?.clone())
    }

    pub async fn record_deviation(&mut self, id: &TaskId, text: &str) -> Result<Task> {
        self.apply(0, |txn| {
            let now = txn.now;
            let task = txn.live_task_mut(id, "record a deviation on")?;
            task.deviations.push(Note {
                text: text.to_string(),
                recorded_at: now,
            });
            task.record(TaskEventKind::DeviationRecorded, now);
            txn.admit(id)?;
            Ok(())
        })
        .await?;
        Ok(self.get(id)?.clone())
    }

    pub async fn park_idea(&mut self, id: &TaskId, text: &str) -> Result<Task> {
        self.apply(0, |txn| {
            let now = txn.now;
            let task = txn.live_task_mut(id, "park an idea on")?;
            task.parked_ideas.push(Note {
                text: text.to_string(),
                recorded_at: now,
            });
            task.record(TaskEventKind::IdeaParked, now);
            txn.admit(id)?;
            Ok(())
        })
        .await?;
        Ok(self.get(id)?.clone())
    }

    /// Update the context weight. A resident pool entry keeps its admitted weight.
    pub async fn set_context_size(&mut self, id: &TaskId, size: u64) -> Result<Task> {
        self.update_field(id, "context_size", |task| task.context_size = size)
            .await
    }

    pub async fn set_urgency(&mut self, id: &TaskId, urgency: Option<f64>) -> Result<Task> {
        self.update_field(id, "urgency", |task| task.urgency = urgency.and_then(unit))
            .await
    }

    pub async fn set_deadline(&mut self, id: &TaskId, deadline: Option<DateTime<Utc>>) -> Result<Task> {
        self.update_field(id, "deadline", |task| task.deadline = deadline)
            .await
    }

    pub async fn set_value(&mut self, id: &TaskId, value: f64) -> Result<Task> {
        self.update_field(id, "value", |task| task.value = unit(value).unwrap_or(DEFAULT_VALUE))
            .await
    }

    async fn update_field(&mut self, id: &TaskId, field: &str, f: impl FnOnce(&mut Task)) -> Result<Task> {
        self.apply(0, |txn| {
            let now = txn.now;
            let task = txn.live_task_mut(id, "update")?;
            f(task);
            task.record(
                TaskEventKind::Updated {
                    field: field.to_string(),
                },
                now,
            );
            txn.admit(id)?;
            Ok(())
        })
        .await?;
        Ok(self.get(id)?.clone())
    }

    // === Invariants, checkpoints, consolidation ===

    /// Repair more than one ACTIVE task or a stale ACTIVE pointer.
    ///
    /// Returns the demoted ids. Nothing is written when the state is sound.
    pub async fn check_invariants(&mut self) -> Result<Vec<TaskId>> {
        let mut txn = self.begin();
        let demoted = txn.repair_active()?;
        let pointer_moved = txn.snap.state.active != self.snapshot.state.active;
        let pool_moved = txn.snap.pool != self.snapshot.pool;
        if txn.dirty.is_empty() && !pointer_moved && !pool_moved {
            return Ok(demoted);
        }
        self.commit(txn, 0).await?;
        Ok(demoted)
    }

    /// Snapshot the current state and reset the transition counter.
    pub async fn checkpoint(&mut self, reason: CheckpointReason) -> Result<CheckpointSummary> {
        let snap = &self.snapshot;
        let checkpoint = Checkpoint::new(
            reason,
            snap.state.version,
            snap.state.active.clone(),
            snap.registry.to_vec(),
            snap.pool.entries().to_vec(),
            self.now(),
        );
        self.checkpoints.write(&checkpoint).await?;
        if let Err(e) = self.checkpoints.prune(self.settings.checkpoint.retain.max(1)).await {
            log::warn!("Failed to prune old checkpoints: {}", e);
        }

        if self.snapshot.state.transitions_since_checkpoint > 0 {
            let mut txn = self.begin();
            txn.snap.state.transitions_since_checkpoint = 0;
            self.commit(txn, 0).await?;
        }
        Ok(CheckpointSummary::from(&checkpoint))
    }

    /// Restore from the latest checkpoint.
    pub async fn recover(&mut self) -> Result<CheckpointSummary> {
        let checkpoint = self
            .checkpoints
            .latest()
            .await?
            .ok_or_else(|| Error::Persistence("no checkpoint to recover from".to_string()))?;
        self.restore_checkpoint(&checkpoint).await?;
        Ok(CheckpointSummary::from(&checkpoint))
    }

    async fn restore_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let state = ControllerState {
            active: checkpoint.active.clone(),
            pool: checkpoint.pool.clone(),
            transitions_since_checkpoint: 0,
            last_consolidated_at: self.snapshot.state.last_consolidated_at,
            version: checkpoint.revision,
        };
        self.store.restore(&checkpoint.tasks, &state).await?;
        self.reload().await?;
        self.check_invariants().await?;
        log::info!(
            "Recovered {} tasks from {} checkpoint {}",
            checkpoint.tasks.len(),
            checkpoint.reason,
            checkpoint.id
        );
        Ok(())
    }

    /// Export every completed task with pending material.
    pub async fn consolidate(&mut self) -> Result<ConsolidationReport> {
        let pending = Consolidator::pending(&self.snapshot.registry);
        self.run_consolidation(&pending).await
    }

    async fn run_consolidation(&mut self, ids: &[TaskId]) -> Result<ConsolidationReport> {
        let Some(consolidator) = self.consolidator.clone() else {
            return Ok(ConsolidationReport::default());
        };

        let mut txn = self.begin();
        let report = consolidator.run(&mut txn.snap.registry, ids, txn.now).await;
        for (task_id, reason) in report.failures() {
            log::warn!("Consolidation of {} incomplete: {}", task_id, reason);
        }
        txn.dirty.extend(report.changed());
        txn.snap.state.last_consolidated_at = Some(txn.now);
        self.commit(txn, 0).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::store::MemoryTaskStore;
    use chrono::Duration;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Harness {
        store: Arc<MemoryTaskStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryTaskStore::new()),
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
                time: Arc::new(Mutex::new(Utc::now())),
            }
        }

        fn advance(&self, by: Duration) {
            *self.time.lock().unwrap() += by;
        }

        async fn open(&self, settings: ControllerSettings) -> LifecycleController {
            let time = self.time.clone();
            let clock: Clock = Arc::new(move || *time.lock().unwrap());
            LifecycleController::open_with_clock(self.store.clone(), self.checkpoints.clone(), settings, clock)
                .await
                .unwrap()
        }
    }

    fn quiet_settings() -> ControllerSettings {
        let mut settings = ControllerSettings::default();
        settings.checkpoint.every_transitions = 0;
        settings
    }

    async fn spawn(ctl: &mut LifecycleController, title: &str) -> TaskId {
        ctl.spawn(SpawnRequest::new(title)).await.unwrap().id
    }

    fn active_count(ctl: &LifecycleController) -> usize {
        ctl.registry().with_status(TaskStatus::Active).len()
    }

    #[tokio::test]
    async fn test_spawn_stays_paused_by_default() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;

        let task = ctl.spawn(SpawnRequest::new("  Write docs ")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.title, "Write docs");
        assert!(ctl.active_id().is_none());
        assert_eq!(task.version, 1);
    }

    #[tokio::test]
    async fn test_spawn_activation_rules() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;

        let first = ctl.spawn(SpawnRequest::new("first").with_activation()).await.unwrap();
        assert_eq!(first.status, TaskStatus::Active);

        // Without preemption the current ACTIVE task keeps its place
        let second = ctl.spawn(SpawnRequest::new("second").with_activation()).await.unwrap();
        assert_eq!(second.status, TaskStatus::Paused);
        assert_eq!(ctl.active_id(), Some(&first.id));

        let mut settings = quiet_settings();
        settings.scheduler.preempt_on_spawn = true;
        let h2 = Harness::new();
        let mut ctl = h2.open(settings).await;
        let a = ctl.spawn(SpawnRequest::new("a").with_activation()).await.unwrap();
        let b = ctl.spawn(SpawnRequest::new("b").with_activation()).await.unwrap();
        assert_eq!(ctl.active_id(), Some(&b.id));
        assert_eq!(ctl.get(&a.id).unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_single_active_across_transitions() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "a").await;
        let b = spawn(&mut ctl, "b").await;
        let c = spawn(&mut ctl, "c").await;

        ctl.switch(&a).await.unwrap();
        assert_eq!(active_count(&ctl), 1);
        ctl.switch(&b).await.unwrap();
        assert_eq!(active_count(&ctl), 1);
        ctl.resume(&c).await.unwrap();
        assert_eq!(active_count(&ctl), 1);
        assert_eq!(ctl.active_id(), Some(&c));
        assert_eq!(ctl.get(&a).unwrap().status, TaskStatus::Paused);
        assert_eq!(ctl.get(&b).unwrap().status, TaskStatus::Paused);

        ctl.pause().await.unwrap();
        assert_eq!(active_count(&ctl), 0);
        assert!(ctl.active_id().is_none());
        assert!(matches!(ctl.pause().await, Err(Error::NoActiveTask)));
    }

    #[tokio::test]
    async fn test_user_signal_makes_b_next() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let _a = spawn(&mut ctl, "A").await;
        let b = spawn(&mut ctl, "B").await;

        ctl.adjust_priority(&b, 1.0).await.unwrap();
        assert_eq!(ctl.next().map(|t| t.id.clone()), Some(b.clone()));
        assert_eq!(ctl.ranked()[0].task.id, b);
    }

    #[tokio::test]
    async fn test_resume_blocked_task_changes_nothing() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let dep = spawn(&mut ctl, "dependency").await;
        let blocked = spawn(&mut ctl, "blocked").await;
        ctl.block(&blocked, std::slice::from_ref(&dep)).await.unwrap();

        let registry_before = ctl.registry().clone();
        let state_before = ctl.state().clone();

        let err = ctl.resume(&blocked).await.unwrap_err();
        assert!(matches!(err, Error::DependencyIncomplete { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(err.hint(), format!("task {} is blocked by {}; complete {} first", blocked, dep, dep));

        assert_eq!(ctl.registry(), &registry_before);
        assert_eq!(ctl.state(), &state_before);
    }

    #[tokio::test]
    async fn test_six_activations_five_slots() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(spawn(&mut ctl, &format!("task {i}")).await);
        }

        for id in &ids {
            h.advance(Duration::minutes(1));
            ctl.switch(id).await.unwrap();
        }

        let pool = ctl.pool();
        assert_eq!(pool.len(), 5);
        assert!(pool.within_limits());
        assert!(pool.contains(&ids[5]));
        // The least recently admitted entry went first
        assert!(!pool.contains(&ids[0]));
        // Eviction never touches the registry
        assert_eq!(ctl.registry().len(), 6);
    }

    #[tokio::test]
    async fn test_complete_unblocks_dependents() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let x = spawn(&mut ctl, "X").await;
        let y = spawn(&mut ctl, "Y").await;
        ctl.block(&y, std::slice::from_ref(&x)).await.unwrap();
        ctl.switch(&x).await.unwrap();

        let completion = ctl.complete(&x).await.unwrap();
        assert_eq!(completion.task.status, TaskStatus::Completed);
        assert_eq!(completion.unblocked, vec![y.clone()]);
        assert_eq!(ctl.get(&y).unwrap().status, TaskStatus::Paused);
        // Completion never auto-activates
        assert!(ctl.active_id().is_none());
        assert!(!ctl.pool().contains(&x));
    }

    #[tokio::test]
    async fn test_persistence_failure_during_switch() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "a").await;
        let b = spawn(&mut ctl, "b").await;
        ctl.switch(&a).await.unwrap();

        let registry_before = ctl.registry().clone();
        h.store.set_fail_writes(true);

        let err = ctl.switch(&b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
        assert_eq!(err.exit_code(), 3);
        assert_eq!(ctl.registry(), &registry_before);
        assert_eq!(ctl.active_id(), Some(&a));

        // Nothing reached the store either
        h.store.set_fail_writes(false);
        let reopened = h.open(quiet_settings()).await;
        assert_eq!(reopened.active_id(), Some(&a));
    }

    #[tokio::test]
    async fn test_terminal_states_are_absorbing() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let done = spawn(&mut ctl, "done").await;
        let dropped = spawn(&mut ctl, "dropped").await;
        ctl.complete(&done).await.unwrap();
        ctl.cancel(&dropped).await.unwrap();

        for id in [&done, &dropped] {
            assert!(matches!(ctl.resume(id).await, Err(Error::InvalidTransition { .. })));
            assert!(matches!(ctl.switch(id).await, Err(Error::InvalidTransition { .. })));
            assert!(matches!(ctl.cancel(id).await, Err(Error::InvalidTransition { .. })));
            assert!(matches!(ctl.record_error(id).await, Err(Error::InvalidTransition { .. })));
            assert!(matches!(ctl.complete(id).await, Err(Error::InvalidTransition { .. })));
            assert!(matches!(ctl.block(id, &[]).await, Err(Error::InvalidTransition { .. })));
        }
        assert_eq!(ctl.queue().len(), 0);
    }

    #[tokio::test]
    async fn test_block_validation() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "a").await;
        let b = spawn(&mut ctl, "b").await;

        let err = ctl.block(&a, &[TaskId::from("task-missing")]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = ctl.block(&a, std::slice::from_ref(&a)).await.unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { .. }));

        ctl.block(&a, std::slice::from_ref(&b)).await.unwrap();
        let err = ctl.block(&b, std::slice::from_ref(&a)).await.unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_blocking_active_clears_pointer() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "a").await;
        let b = spawn(&mut ctl, "b").await;
        ctl.switch(&a).await.unwrap();

        ctl.block(&a, std::slice::from_ref(&b)).await.unwrap();
        assert!(ctl.active_id().is_none());
        assert_eq!(ctl.get(&a).unwrap().status, TaskStatus::Blocked);

        // Unblock refuses while b is open
        assert!(matches!(ctl.unblock(&a).await, Err(Error::DependencyIncomplete { .. })));
    }

    #[tokio::test]
    async fn test_error_count_monotonic() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "flaky").await;

        let mut last = 0;
        for _ in 0..3 {
            let count = ctl.record_error(&a).await.unwrap();
            assert!(count > last);
            last = count;
        }
        assert_eq!(ctl.get(&a).unwrap().error_count, 3);
    }

    #[tokio::test]
    async fn test_signals_update_task() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "signals").await;

        ctl.record_decision(&a, "Use JSON", "readable", None).await.unwrap();
        ctl.record_deviation(&a, "skipped the benchmark").await.unwrap();
        ctl.park_idea(&a, "cache scores").await.unwrap();
        ctl.set_context_size(&a, 1200).await.unwrap();
        ctl.set_urgency(&a, Some(4.0)).await.unwrap();
        ctl.set_value(&a, f64::NAN).await.unwrap();
        let deadline = *h.time.lock().unwrap() + Duration::days(2);
        let task = ctl.set_deadline(&a, Some(deadline)).await.unwrap();

        assert_eq!(task.decisions.len(), 1);
        assert_eq!(task.deviations.len(), 1);
        assert_eq!(task.parked_ideas.len(), 1);
        assert_eq!(task.context_size, 1200);
        assert_eq!(task.urgency, Some(1.0));
        assert_eq!(task.value, DEFAULT_VALUE);
        assert!(task.deadline.is_some());
    }

    #[tokio::test]
    async fn test_touch_admits_to_pool() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "a").await;

        assert!(matches!(ctl.touch(&a).await.unwrap(), Admission::Admitted { .. }));
        assert_eq!(ctl.touch(&a).await.unwrap(), Admission::Refreshed);
        assert_eq!(ctl.pool().get(&a).unwrap().access_count, 2);
    }

    #[tokio::test]
    async fn test_signals_count_as_access() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "decided").await;
        let b = spawn(&mut ctl, "resized").await;
        let c = spawn(&mut ctl, "failing").await;
        assert!(ctl.pool().is_empty());

        ctl.record_decision(&a, "Use JSON", "readable", None).await.unwrap();
        ctl.set_context_size(&b, 300).await.unwrap();
        ctl.record_error(&c).await.unwrap();
        assert!(ctl.pool().contains(&a));
        assert!(ctl.pool().contains(&b));
        assert!(ctl.pool().contains(&c));

        ctl.park_idea(&a, "try msgpack").await.unwrap();
        assert_eq!(ctl.pool().get(&a).unwrap().access_count, 2);
    }

    /// Holds back writes until the next read, simulating another session
    /// committing between two reads of the store.
    #[derive(Default)]
    struct InterleavingStore {
        inner: MemoryTaskStore,
        hold: std::sync::atomic::AtomicBool,
        held: Mutex<Vec<WriteBatch>>,
    }

    impl InterleavingStore {
        async fn release_held(&self) {
            let held = std::mem::take(&mut *self.held.lock().unwrap());
            for batch in held {
                self.inner.commit(&batch).await.unwrap();
            }
        }
    }

    #[async_trait::async_trait]
    impl TaskStore for InterleavingStore {
        async fn load_all(&self) -> Result<Vec<Task>> {
            let tasks = self.inner.load_all().await;
            self.release_held().await;
            tasks
        }

        async fn load_snapshot(&self) -> Result<(Vec<Task>, Option<ControllerState>)> {
            let snapshot = self.inner.load_snapshot().await;
            self.release_held().await;
            snapshot
        }

        async fn save(&self, task: &Task) -> Result<()> {
            self.inner.save(task).await
        }

        async fn append_history(&self, id: &TaskId, event: &crate::task::TaskEvent) -> Result<()> {
            self.inner.append_history(id, event).await
        }

        async fn load_state(&self) -> Result<Option<ControllerState>> {
            let state = self.inner.load_state().await;
            self.release_held().await;
            state
        }

        async fn commit(&self, batch: &WriteBatch) -> Result<()> {
            if self.hold.load(std::sync::atomic::Ordering::SeqCst) {
                self.held.lock().unwrap().push(batch.clone());
                return Ok(());
            }
            self.inner.commit(batch).await
        }

        async fn restore(&self, tasks: &[Task], state: &ControllerState) -> Result<()> {
            self.inner.restore(tasks, state).await
        }
    }

    #[tokio::test]
    async fn test_open_during_foreign_commit_keeps_pointer_consistent() {
        let store = Arc::new(InterleavingStore::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());

        let mut other = LifecycleController::open(store.clone(), checkpoints.clone(), quiet_settings())
            .await
            .unwrap();
        let x = other.spawn(SpawnRequest::new("x").with_activation()).await.unwrap().id;
        let y = spawn(&mut other, "y").await;

        // The switch lands in the store right after this session's first read
        store.hold.store(true, std::sync::atomic::Ordering::SeqCst);
        other.switch(&y).await.unwrap();
        store.hold.store(false, std::sync::atomic::Ordering::SeqCst);

        let mut ctl = LifecycleController::open(store.clone(), checkpoints, quiet_settings())
            .await
            .unwrap();
        assert_eq!(ctl.active_id(), Some(&x));
        assert_eq!(active_count(&ctl), 1);

        let (tasks, state) = store.inner.load_snapshot().await.unwrap();
        let active: Vec<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Active)
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(active, vec![y.clone()]);
        assert_eq!(state.unwrap().active, Some(y));

        // The stale view is refused, not written
        assert!(matches!(ctl.pause().await, Err(Error::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_open_demotes_extra_active_tasks() {
        let h = Harness::new();
        let now = *h.time.lock().unwrap();

        // Two ACTIVE records written behind the controller's back
        let mut older = Task::new("older", now);
        older.status = TaskStatus::Active;
        older.activated_at = Some(now - Duration::hours(1));
        older.version = 1;
        let mut newer = Task::new("newer", now);
        newer.status = TaskStatus::Active;
        newer.activated_at = Some(now);
        newer.version = 1;
        h.store
            .commit(&WriteBatch {
                tasks: vec![older.clone(), newer.clone()],
                state: None,
            })
            .await
            .unwrap();

        let ctl = h.open(quiet_settings()).await;
        assert_eq!(active_count(&ctl), 1);
        assert_eq!(ctl.active_id(), Some(&newer.id));
        let demoted = ctl.get(&older.id).unwrap();
        assert_eq!(demoted.status, TaskStatus::Paused);
        assert_eq!(demoted.history.last().map(|e| &e.kind), Some(&TaskEventKind::Demoted));
    }

    #[tokio::test]
    async fn test_periodic_checkpoint() {
        let h = Harness::new();
        let mut settings = ControllerSettings::default();
        settings.checkpoint.every_transitions = 3;
        let mut ctl = h.open(settings).await;

        spawn(&mut ctl, "one").await;
        spawn(&mut ctl, "two").await;
        assert_eq!(h.checkpoints.count().await, 0);
        spawn(&mut ctl, "three").await;
        assert_eq!(h.checkpoints.count().await, 1);
        assert_eq!(ctl.state().transitions_since_checkpoint, 0);
    }

    #[tokio::test]
    async fn test_failed_periodic_checkpoint_keeps_transition() {
        let h = Harness::new();
        let mut settings = ControllerSettings::default();
        settings.checkpoint.every_transitions = 1;
        let mut ctl = h.open(settings).await;

        h.checkpoints.set_fail_writes(true);
        let err = ctl.spawn(SpawnRequest::new("kept")).await.unwrap_err();
        assert!(matches!(err, Error::CheckpointFailed(_)));
        assert_eq!(ctl.registry().len(), 1);
        assert_eq!(ctl.state().transitions_since_checkpoint, 1);

        // The trigger stays due and fires on the next transition
        h.checkpoints.set_fail_writes(false);
        spawn(&mut ctl, "next").await;
        assert_eq!(h.checkpoints.count().await, 1);
    }

    #[tokio::test]
    async fn test_open_restores_checkpoint_into_empty_store() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "survivor").await;
        ctl.switch(&a).await.unwrap();
        ctl.checkpoint(CheckpointReason::Manual).await.unwrap();

        // Same checkpoints, wiped registry
        let fresh = Harness {
            store: Arc::new(MemoryTaskStore::new()),
            checkpoints: h.checkpoints.clone(),
            time: h.time.clone(),
        };
        let restored = fresh.open(quiet_settings()).await;
        assert_eq!(restored.registry().len(), 1);
        assert_eq!(restored.active_id(), Some(&a));
        assert!(restored.pool().contains(&a));
    }

    #[tokio::test]
    async fn test_recover_without_checkpoint_fails() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let err = ctl.recover().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
    }

    #[tokio::test]
    async fn test_complete_consolidates_with_files() {
        let temp = TempDir::new().unwrap();
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await.with_consolidator(Consolidator::with_files(
            temp.path().join("decisions"),
            temp.path().join("summaries"),
            temp.path().join("reindex-queue.jsonl"),
        ));
        let a = spawn(&mut ctl, "exported").await;
        ctl.record_decision(&a, "Ship it", "deadline", None).await.unwrap();

        let completion = ctl.complete(&a).await.unwrap();
        let export = completion.export.unwrap();
        assert_eq!(export.decisions_exported, 1);
        assert!(export.summary_exported);
        assert!(!completion.task.has_pending_export());
        assert_eq!(ctl.pending_consolidation(), 0);

        // Nothing left to do
        let report = ctl.consolidate().await.unwrap();
        assert!(report.is_empty());
        assert!(ctl.state().last_consolidated_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_consolidation_commit_does_not_duplicate_exports() {
        let temp = TempDir::new().unwrap();
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "exported once").await;
        ctl.record_decision(&a, "Keep the cache", "hit rate is 90%", None)
            .await
            .unwrap();
        ctl.complete(&a).await.unwrap();
        assert_eq!(ctl.pending_consolidation(), 1);

        let mut ctl = ctl.with_consolidator(Consolidator::with_files(
            temp.path().join("decisions"),
            temp.path().join("summaries"),
            temp.path().join("reindex-queue.jsonl"),
        ));
        h.store.set_fail_writes(true);
        let err = ctl.consolidate().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
        assert_eq!(ctl.pending_consolidation(), 1);

        h.store.set_fail_writes(false);
        let report = ctl.consolidate().await.unwrap();
        assert_eq!(report.decisions_exported(), 1);
        assert_eq!(ctl.pending_consolidation(), 0);

        let decisions: Vec<_> = std::fs::read_dir(temp.path().join("decisions")).unwrap().collect();
        assert_eq!(decisions.len(), 1);
        assert_eq!(std::fs::read_dir(temp.path().join("summaries")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_skips_export() {
        let h = Harness::new();
        let mut ctl = h.open(quiet_settings()).await;
        let a = spawn(&mut ctl, "dropped").await;
        ctl.park_idea(&a, "maybe later").await.unwrap();
        ctl.touch(&a).await.unwrap();

        let task = ctl.cancel(&a).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.parked_ideas.len(), 1);
        assert!(!ctl.pool().contains(&a));
        assert_eq!(ctl.pending_consolidation(), 0);
    }
}
