//! Task types for cogtask.
//!
//! A Task is the unit of trackable work. Its full history travels with the
//! record so the registry doubles as an audit log.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new task ID using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(format!("task-{}", Uuid::now_v7()))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The single task currently receiving attention
    Active,
    /// Set aside, resumable
    Paused,
    /// Waiting on other tasks
    Blocked,
    /// Finished successfully
    Completed,
    /// Abandoned
    Cancelled,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Check if the task can transition to the given status.
    ///
    /// Dependency checks are the controller's job; this only encodes the
    /// shape of the state machine.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            // Terminal states are absorbing
            (Completed | Cancelled, _) => false,
            // Any live state can be finished or blocked
            (_, Completed | Cancelled | Blocked) => true,
            (Active, Paused) => true,
            (Paused | Blocked, Active) => true,
            (Blocked, Paused) => true,
            (from, to) if *from == to => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A short free-text note attached to a task (deviation or parked idea).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

/// A decision recorded while working on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Short statement of what was decided.
    pub title: String,
    /// Why it was decided.
    pub rationale: String,
    /// Identifier of an earlier decision this one replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Consolidation progress for a task.
///
/// Each export step advances its own marker so a retry after a partial
/// failure resumes where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportMarker {
    /// Number of leading `decisions` already handed to the decision sink.
    pub decisions_exported: usize,
    /// Whether the session summary was handed to the summary sink.
    pub summary_exported: bool,
    /// When the last export step finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Utc>>,
}

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEventKind {
    Spawned,
    Activated,
    Paused,
    Blocked { by: Vec<TaskId> },
    Unblocked,
    Completed,
    Cancelled,
    /// Demoted to PAUSED while repairing a double-ACTIVE state.
    Demoted,
    PriorityAdjusted { signal: f64 },
    ErrorRecorded { count: u32 },
    DecisionRecorded { title: String },
    DeviationRecorded,
    IdeaParked,
    Updated { field: String },
    Exported,
}

/// A history entry for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub fn new(kind: TaskEventKind, at: DateTime<Utc>) -> Self {
        Self { at, kind }
    }
}

/// A trackable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Short human label
    pub title: String,
    /// Current status
    pub status: TaskStatus,
    /// User adjustment in [-1, 1]
    pub priority_signal: f64,
    /// Externally supplied urgency in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<f64>,
    /// Optional deadline; urgency rises as it approaches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Static importance rating in [0, 1]
    pub value: f64,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// Last access or mutation
    pub last_touched_at: DateTime<Utc>,
    /// When the task last became active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// Failed work attempts; never decremented
    pub error_count: u32,
    /// Tasks this one waits on
    #[serde(default)]
    pub blocked_by: BTreeSet<TaskId>,
    /// Estimated weight of the task's working context
    pub context_size: u64,
    #[serde(default)]
    pub deviations: Vec<Note>,
    #[serde(default)]
    pub parked_ideas: Vec<Note>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    /// Audit trail
    #[serde(default)]
    pub history: Vec<TaskEvent>,
    #[serde(default)]
    pub export: ExportMarker,
    /// Optimistic-concurrency version of the durable record
    #[serde(default)]
    pub version: u64,
}

/// Default importance for tasks that were not rated.
pub const DEFAULT_VALUE: f64 = 0.5;

impl Task {
    /// Create a new paused task.
    pub fn new(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            title: title.into(),
            status: TaskStatus::Paused,
            priority_signal: 0.0,
            urgency: None,
            deadline: None,
            value: DEFAULT_VALUE,
            created_at: now,
            last_touched_at: now,
            activated_at: None,
            error_count: 0,
            blocked_by: BTreeSet::new(),
            context_size: 0,
            deviations: Vec::new(),
            parked_ideas: Vec::new(),
            decisions: Vec::new(),
            history: vec![TaskEvent::new(TaskEventKind::Spawned, now)],
            export: ExportMarker::default(),
            version: 0,
        }
    }

    /// Record an access or mutation.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_touched_at {
            self.last_touched_at = now;
        }
    }

    /// Append a history event and touch the task.
    pub fn record(&mut self, kind: TaskEventKind, now: DateTime<Utc>) {
        self.history.push(TaskEvent::new(kind, now));
        self.touch(now);
    }

    /// Increment the error counter.
    pub fn record_error(&mut self, now: DateTime<Utc>) -> u32 {
        self.error_count = self.error_count.saturating_add(1);
        let count = self.error_count;
        self.record(TaskEventKind::ErrorRecorded { count }, now);
        count
    }

    /// Set the user priority signal, clamped to [-1, 1].
    pub fn set_priority_signal(&mut self, signal: f64, now: DateTime<Utc>) {
        let signal = if signal.is_finite() { signal.clamp(-1.0, 1.0) } else { 0.0 };
        self.priority_signal = signal;
        self.record(TaskEventKind::PriorityAdjusted { signal }, now);
    }

    /// Whether the task has material consolidation has not exported yet.
    pub fn has_pending_export(&self) -> bool {
        self.status == TaskStatus::Completed
            && (self.export.decisions_exported < self.decisions.len() || !self.export.summary_exported)
    }
}
