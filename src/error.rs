//! Error types for cogtask.

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Coarse error classification surfaced to callers and the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown task id.
    NotFound,
    /// The request violates the lifecycle state machine.
    InvalidTransition,
    /// Scheduler state broke an invariant (auto-corrected where possible).
    InvariantViolation,
    /// A durable read or write failed; the operation did not happen.
    PersistenceFailure,
    /// A consolidation sink could not be reached.
    ExportFailure,
    /// Configuration could not be loaded.
    Config,
}

impl ErrorKind {
    /// Process exit code for the command surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::NotFound => 2,
            ErrorKind::InvalidTransition | ErrorKind::InvariantViolation | ErrorKind::Config => 1,
            ErrorKind::PersistenceFailure | ErrorKind::ExportFailure => 3,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidTransition => "invalid-transition",
            ErrorKind::InvariantViolation => "invariant-violation",
            ErrorKind::PersistenceFailure => "persistence-failure",
            ErrorKind::ExportFailure => "export-failure",
            ErrorKind::Config => "config",
        };
        write!(f, "{s}")
    }
}

/// cogtask error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Task not found
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Invalid lifecycle transition
    #[error("cannot {action} task {id}: it is {from}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        action: &'static str,
    },

    /// Activation refused because dependencies are still open
    #[error("task {id} is blocked by {}", join_ids(.blockers))]
    DependencyIncomplete { id: TaskId, blockers: Vec<TaskId> },

    /// An operation needed an ACTIVE task and there is none
    #[error("no task is active")]
    NoActiveTask,

    /// Dependency graph would contain a cycle
    #[error("blocking {id} on {on} would create a dependency cycle")]
    DependencyCycle { id: TaskId, on: TaskId },

    /// Invariant violation detected in scheduler state
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Durable store read/write failure
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Another session changed a record since it was loaded
    #[error("conflict: {record} was changed by another session (expected version {expected}, found {found})")]
    Conflict { record: String, expected: u64, found: u64 },

    /// A transition was saved but the automatic checkpoint could not be written
    #[error("checkpoint failed after transition: {0}")]
    CheckpointFailed(String),

    /// Consolidation sink failure
    #[error("export failed for task {task_id}: {reason}")]
    Export { task_id: TaskId, reason: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TaskNotFound { .. } => ErrorKind::NotFound,
            Error::InvalidTransition { .. }
            | Error::DependencyIncomplete { .. }
            | Error::NoActiveTask
            | Error::DependencyCycle { .. } => ErrorKind::InvalidTransition,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Error::Persistence(_)
            | Error::Conflict { .. }
            | Error::CheckpointFailed(_)
            | Error::Io(_)
            | Error::Serialization(_) => ErrorKind::PersistenceFailure,
            Error::Export { .. } => ErrorKind::ExportFailure,
            Error::Config(_) | Error::Yaml(_) => ErrorKind::Config,
        }
    }

    /// Process exit code for the command surface.
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Actionable next step for a human operator.
    pub fn hint(&self) -> String {
        match self {
            Error::TaskNotFound { .. } => "check the id with `ctm status`".to_string(),
            Error::InvalidTransition { id, from, .. } if from.is_terminal() => {
                format!("task {id} is finished; spawn a new task instead")
            }
            Error::InvalidTransition { .. } => "see `ctm status` for the task's current state".to_string(),
            Error::DependencyIncomplete { id, blockers } => {
                format!("task {id} is blocked by {}; complete {} first", join_ids(blockers), join_ids(blockers))
            }
            Error::NoActiveTask => "resume or switch to a task first".to_string(),
            Error::DependencyCycle { .. } => "choose a dependency that does not depend on this task".to_string(),
            Error::InvariantViolation(_) => "state was repaired automatically; re-check with `ctm status`".to_string(),
            Error::Conflict { .. } => "another session changed the registry; your last action was not saved, reload and retry".to_string(),
            Error::CheckpointFailed(_) => "the action was saved but no checkpoint was written; run `ctm checkpoint`".to_string(),
            Error::Persistence(_) | Error::Io(_) | Error::Serialization(_) => {
                "your last action was not saved; retry".to_string()
            }
            Error::Export { .. } => "exports are retried by the next `ctm consolidate`".to_string(),
            Error::Config(_) | Error::Yaml(_) => "fix the configuration file or pass --config".to_string(),
        }
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
}

/// Result type alias for cogtask.
pub type Result<T> = std::result::Result<T, Error>;
