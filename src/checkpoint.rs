//! Checkpoints: immutable snapshots of the registry, pool and ACTIVE pointer.
//!
//! A checkpoint is written once and only ever superseded by a newer one.
//! Recovery loads the latest.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pool::PoolEntry;
use crate::task::{Task, TaskId};

/// What caused a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    /// Transition counter reached its threshold
    Periodic,
    ContextPressure,
    SessionEnd,
    /// Explicit request
    Manual,
}

impl std::fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointReason::Periodic => "periodic",
            CheckpointReason::ContextPressure => "context-pressure",
            CheckpointReason::SessionEnd => "session-end",
            CheckpointReason::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// A timestamped snapshot of controller state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    /// State row version this snapshot reflects.
    pub revision: u64,
    pub active: Option<TaskId>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub pool: Vec<PoolEntry>,
}

impl Checkpoint {
    pub fn new(
        reason: CheckpointReason,
        revision: u64,
        active: Option<TaskId>,
        tasks: Vec<Task>,
        pool: Vec<PoolEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("ckpt-{}", Uuid::now_v7()),
            created_at: now,
            reason,
            revision,
            active,
            tasks,
            pool,
        }
    }
}

/// Brief description of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    pub revision: u64,
    pub task_count: usize,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(c: &Checkpoint) -> Self {
        Self {
            id: c.id.clone(),
            created_at: c.created_at,
            reason: c.reason,
            revision: c.revision,
            task_count: c.tasks.len(),
        }
    }
}

/// Storage for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint. Failures are errors, never silent.
    async fn write(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// The most recent checkpoint, if any.
    async fn latest(&self) -> Result<Option<Checkpoint>>;

    /// All checkpoints, oldest first.
    async fn list(&self) -> Result<Vec<CheckpointSummary>>;

    /// Delete all but the newest `retain` checkpoints. Returns how many were removed.
    async fn prune(&self, retain: usize) -> Result<usize>;
}

fn newest_first(a: &Checkpoint, b: &Checkpoint) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.revision.cmp(&a.revision))
        .then_with(|| b.id.cmp(&a.id))
}

/// Stores each checkpoint as `<dir>/<id>.json`.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the base path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.path.exists() {
            fs::create_dir_all(&self.path).await.map_err(|e| {
                Error::Persistence(format!("failed to create checkpoint directory {}: {}", self.path.display(), e))
            })?;
        }
        Ok(())
    }

    /// Load every readable checkpoint with its file, newest first.
    async fn load_all(&self) -> Result<Vec<(PathBuf, Checkpoint)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        let mut entries = fs::read_dir(&self.path)
            .await
            .map_err(|e| Error::Persistence(format!("failed to read checkpoint directory: {}", e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Persistence(format!("failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(json) => match serde_json::from_str::<Checkpoint>(&json) {
                    Ok(checkpoint) => checkpoints.push((path, checkpoint)),
                    Err(e) => log::warn!("Skipping corrupted checkpoint {}: {}", path.display(), e),
                },
                Err(e) => log::warn!("Failed to read checkpoint {}: {}", path.display(), e),
            }
        }

        checkpoints.sort_by(|a, b| newest_first(&a.1, &b.1));
        Ok(checkpoints)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.ensure_dir().await?;
        let json = serde_json::to_string_pretty(checkpoint)?;
        let path = self.path.join(format!("{}.json", checkpoint.id));
        tokio::task::spawn_blocking(move || crate::store::write_atomic(&path, &json))
            .await
            .map_err(|e| Error::Persistence(format!("checkpoint writer panicked: {}", e)))??;
        log::info!("Wrote {} checkpoint {}", checkpoint.reason, checkpoint.id);
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.load_all().await?.into_iter().next().map(|(_, c)| c))
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>> {
        let mut summaries: Vec<_> = self.load_all().await?.iter().map(|(_, c)| c.into()).collect();
        summaries.reverse();
        Ok(summaries)
    }

    async fn prune(&self, retain: usize) -> Result<usize> {
        let stale: Vec<_> = self.load_all().await?.into_iter().skip(retain).collect();
        for (path, checkpoint) in &stale {
            fs::remove_file(path)
                .await
                .map_err(|e| Error::Persistence(format!("failed to remove checkpoint {}: {}", checkpoint.id, e)))?;
        }
        if !stale.is_empty() {
            log::debug!("Pruned {} old checkpoints", stale.len());
        }
        Ok(stale.len())
    }
}

/// In-memory checkpoint store with write-failure injection.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<Vec<Checkpoint>>,
    fail_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn count(&self) -> usize {
        self.checkpoints.lock().await.len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence("injected checkpoint failure".to_string()));
        }
        self.checkpoints.lock().await.push(checkpoint.clone());
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints.iter().min_by(|a, b| newest_first(a, b)).cloned())
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>> {
        let mut checkpoints = self.checkpoints.lock().await.clone();
        checkpoints.sort_by(|a, b| newest_first(b, a));
        Ok(checkpoints.iter().map(CheckpointSummary::from).collect())
    }

    async fn prune(&self, retain: usize) -> Result<usize> {
        let mut checkpoints = self.checkpoints.lock().await;
        checkpoints.sort_by(newest_first);
        let removed = checkpoints.len().saturating_sub(retain);
        checkpoints.truncate(retain);
        Ok(removed)
    }
}
