//! Durable task store.
//!
//! The store holds every task record plus one controller state row (ACTIVE
//! pointer, pool contents, checkpoint counter). Each record carries a
//! version; a write succeeds only if the stored version is the one the
//! writer loaded, so concurrent sessions cannot silently overwrite each other.

use std::collections::BTreeMap;
use std::fs::{self as stdfs, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::pool::PoolEntry;
use crate::task::{Task, TaskEvent, TaskId};

/// Durable controller record stored next to the tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    /// The ACTIVE task, if any.
    pub active: Option<TaskId>,
    /// Working memory pool contents.
    #[serde(default)]
    pub pool: Vec<PoolEntry>,
    /// Lifecycle transitions since the last checkpoint.
    #[serde(default)]
    pub transitions_since_checkpoint: u32,
    #[serde(default)]
    pub last_consolidated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

/// An all-or-nothing write: changed tasks plus the new state row.
///
/// Versions in the batch are the new versions; the store expects the
/// stored versions to be exactly one lower.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub tasks: Vec<Task>,
    pub state: Option<ControllerState>,
}

/// Boundary contract for the durable registry.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Load every task record.
    async fn load_all(&self) -> Result<Vec<Task>>;

    /// Load every task record and the state row from one version of the
    /// store, so the two always agree.
    async fn load_snapshot(&self) -> Result<(Vec<Task>, Option<ControllerState>)>;

    /// Atomic single-task upsert.
    async fn save(&self, task: &Task) -> Result<()>;

    /// Append an event to a task's history.
    async fn append_history(&self, id: &TaskId, event: &TaskEvent) -> Result<()>;

    /// Load the controller state row, if one was ever written.
    async fn load_state(&self) -> Result<Option<ControllerState>>;

    /// Apply a batch atomically, checking versions.
    async fn commit(&self, batch: &WriteBatch) -> Result<()>;

    /// Overwrite everything with recovered records, bumping versions past
    /// whatever is stored.
    async fn restore(&self, tasks: &[Task], state: &ControllerState) -> Result<()>;
}

/// Serialized form of the whole registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryImage {
    #[serde(default)]
    state: Option<ControllerState>,
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
}

impl RegistryImage {
    fn check_version(record: &str, stored: Option<u64>, incoming: u64) -> Result<()> {
        let expected = incoming.saturating_sub(1);
        let found = stored.unwrap_or(0);
        if found != expected || incoming == 0 {
            return Err(Error::Conflict {
                record: record.to_string(),
                expected,
                found,
            });
        }
        Ok(())
    }

    fn apply(&mut self, batch: &WriteBatch) -> Result<()> {
        // Validate everything before touching anything
        for task in &batch.tasks {
            let stored = self.tasks.get(&task.id).map(|t| t.version);
            Self::check_version(task.id.as_ref(), stored, task.version)?;
        }
        if let Some(state) = &batch.state {
            let stored = self.state.as_ref().map(|s| s.version);
            Self::check_version("controller state", stored, state.version)?;
        }

        for task in &batch.tasks {
            self.tasks.insert(task.id.clone(), task.clone());
        }
        if let Some(state) = &batch.state {
            self.state = Some(state.clone());
        }
        Ok(())
    }

    fn append_history(&mut self, id: &TaskId, event: &TaskEvent) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        task.history.push(event.clone());
        task.version += 1;
        Ok(())
    }

    fn restore(&mut self, tasks: &[Task], state: &ControllerState) {
        let mut restored = BTreeMap::new();
        for task in tasks {
            let mut task = task.clone();
            let stored = self.tasks.get(&task.id).map(|t| t.version).unwrap_or(0);
            task.version = stored.max(task.version) + 1;
            restored.insert(task.id.clone(), task);
        }
        // Records newer than the checkpoint are kept: ids are never reused
        for (id, task) in std::mem::take(&mut self.tasks) {
            restored.entry(id).or_insert(task);
        }
        let mut state = state.clone();
        let stored = self.state.as_ref().map(|s| s.version).unwrap_or(0);
        state.version = stored.max(state.version) + 1;
        self.tasks = restored;
        self.state = Some(state);
    }
}

/// JSON-file registry under the data directory.
///
/// Readers see whole files only (temp file + rename); writers hold an
/// advisory lock on a sibling `.lock` file for the read-check-write window.
pub struct FileTaskStore {
    path: PathBuf,
}

impl FileTaskStore {
    /// Create a store backed by `path` (created on first write).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the registry file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    async fn read_image(&self) -> Result<RegistryImage> {
        if !self.path.exists() {
            return Ok(RegistryImage::default());
        }
        let json = fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Persistence(format!("failed to read registry {}: {}", self.path.display(), e)))?;
        serde_json::from_str(&json).map_err(|e| {
            log::warn!("Corrupted registry file {}: {}", self.path.display(), e);
            Error::Persistence(format!("failed to parse registry: {}", e))
        })
    }

    /// Run `mutate` on the image under the file lock and write the result.
    ///
    /// With `replace_corrupt`, an unparsable registry is treated as empty
    /// instead of failing the write.
    async fn locked_update<F>(&self, replace_corrupt: bool, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RegistryImage) -> Result<()> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || locked_update_blocking(&path, &lock_path, replace_corrupt, mutate))
            .await
            .map_err(|e| Error::Persistence(format!("registry writer panicked: {}", e)))?
    }
}

fn locked_update_blocking<F>(path: &Path, lock_path: &Path, replace_corrupt: bool, mutate: F) -> Result<()>
where
    F: FnOnce(&mut RegistryImage) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        stdfs::create_dir_all(parent)
            .map_err(|e| Error::Persistence(format!("failed to create {}: {}", parent.display(), e)))?;
    }
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| Error::Persistence(format!("failed to open lock {}: {}", lock_path.display(), e)))?;
    lock.lock_exclusive()
        .map_err(|e| Error::Persistence(format!("failed to lock registry: {}", e)))?;

    let result = (|| {
        let mut image = if path.exists() {
            let json = stdfs::read_to_string(path)
                .map_err(|e| Error::Persistence(format!("failed to read registry: {}", e)))?;
            match serde_json::from_str(&json) {
                Ok(image) => image,
                Err(e) if replace_corrupt => {
                    log::warn!("Replacing corrupted registry {}: {}", path.display(), e);
                    RegistryImage::default()
                }
                Err(e) => return Err(Error::Persistence(format!("failed to parse registry: {}", e))),
            }
        } else {
            RegistryImage::default()
        };
        mutate(&mut image)?;
        let json = serde_json::to_string_pretty(&image)?;
        write_atomic(path, &json)
    })();

    if let Err(e) = FileExt::unlock(&lock) {
        log::warn!("Failed to release registry lock: {}", e);
    }
    result
}

/// Write via a synced temp file and rename so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("registry"),
        std::process::id()
    );
    let tmp_path = path
        .parent()
        .map(|p| p.join(&tmp_name))
        .unwrap_or_else(|| PathBuf::from(&tmp_name));

    let write_err = |e: std::io::Error| Error::Persistence(format!("failed to write {}: {}", tmp_path.display(), e));
    let mut file = File::create(&tmp_path).map_err(write_err)?;
    file.write_all(content.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);
    stdfs::rename(&tmp_path, path)
        .map_err(|e| Error::Persistence(format!("failed to replace {}: {}", path.display(), e)))?;
    Ok(())
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn load_all(&self) -> Result<Vec<Task>> {
        Ok(self.read_image().await?.tasks.into_values().collect())
    }

    async fn load_snapshot(&self) -> Result<(Vec<Task>, Option<ControllerState>)> {
        let image = self.read_image().await?;
        Ok((image.tasks.into_values().collect(), image.state))
    }

    async fn save(&self, task: &Task) -> Result<()> {
        let batch = WriteBatch {
            tasks: vec![task.clone()],
            state: None,
        };
        self.locked_update(false, move |image| image.apply(&batch)).await
    }

    async fn append_history(&self, id: &TaskId, event: &TaskEvent) -> Result<()> {
        let id = id.clone();
        let event = event.clone();
        self.locked_update(false, move |image| image.append_history(&id, &event)).await
    }

    async fn load_state(&self) -> Result<Option<ControllerState>> {
        Ok(self.read_image().await?.state)
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<()> {
        let batch = batch.clone();
        self.locked_update(false, move |image| image.apply(&batch)).await
    }

    async fn restore(&self, tasks: &[Task], state: &ControllerState) -> Result<()> {
        let tasks = tasks.to_vec();
        let state = state.clone();
        self.locked_update(true, move |image| {
            image.restore(&tasks, &state);
            Ok(())
        })
        .await
    }
}

/// In-memory store with write-failure injection.
#[derive(Default)]
pub struct MemoryTaskStore {
    image: Mutex<RegistryImage>,
    fail_writes: AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `Error::Persistence`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_all(&self) -> Result<Vec<Task>> {
        Ok(self.image.lock().await.tasks.values().cloned().collect())
    }

    async fn load_snapshot(&self) -> Result<(Vec<Task>, Option<ControllerState>)> {
        let image = self.image.lock().await;
        Ok((image.tasks.values().cloned().collect(), image.state.clone()))
    }

    async fn save(&self, task: &Task) -> Result<()> {
        self.check_writable()?;
        self.image.lock().await.apply(&WriteBatch {
            tasks: vec![task.clone()],
            state: None,
        })
    }

    async fn append_history(&self, id: &TaskId, event: &TaskEvent) -> Result<()> {
        self.check_writable()?;
        self.image.lock().await.append_history(id, event)
    }

    async fn load_state(&self) -> Result<Option<ControllerState>> {
        Ok(self.image.lock().await.state.clone())
    }

    async fn commit(&self, batch: &WriteBatch) -> Result<()> {
        self.check_writable()?;
        self.image.lock().await.apply(batch)
    }

    async fn restore(&self, tasks: &[Task], state: &ControllerState) -> Result<()> {
        self.check_writable()?;
        self.image.lock().await.restore(tasks, state);
        Ok(())
    }
}
