//! Consolidation: export what a completed task produced to long-term sinks.
//!
//! Decisions go first, then a summary, then a reindex request for whatever
//! was written. Each step advances the task's export marker, so a run that
//! fails halfway is resumed, not repeated, by the next run.
//!
//! Markers reach the store only after the sinks were written. A run whose
//! commit fails is replayed from the old markers, so sinks key every write
//! on the task and decision number and overwrite what is already there.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::registry::TaskRegistry;
use crate::task::{Decision, Task, TaskEventKind, TaskId};

/// Long-term store for decisions.
#[async_trait]
pub trait DecisionSink: Send + Sync {
    /// Export decision number `seq` (1-based) of a task. Exporting the same
    /// `(task_id, seq)` again must replace the earlier record.
    ///
    /// Returns where it landed, if it has a location.
    async fn export_decision(&self, task_id: &TaskId, seq: usize, decision: &Decision) -> Result<Option<PathBuf>>;
}

/// Long-term store for per-task summaries. One summary per task; a later
/// export replaces it.
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn export_summary(&self, task_id: &TaskId, summary: &str) -> Result<Option<PathBuf>>;
}

/// Asks a search index to pick up new material.
#[async_trait]
pub trait IndexTrigger: Send + Sync {
    async fn request_reindex(&self, paths: &[PathBuf]) -> Result<()>;
}

/// Outcome of exporting one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskExport {
    pub task_id: TaskId,
    pub decisions_exported: usize,
    pub summary_exported: bool,
    pub paths: Vec<PathBuf>,
    /// Set when a step failed; later steps were not attempted.
    pub error: Option<String>,
}

/// Result of a consolidation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub exports: Vec<TaskExport>,
}

impl ConsolidationReport {
    pub fn decisions_exported(&self) -> usize {
        self.exports.iter().map(|e| e.decisions_exported).sum()
    }

    pub fn summaries_exported(&self) -> usize {
        self.exports.iter().filter(|e| e.summary_exported).count()
    }

    /// Tasks whose export failed, with the reason.
    pub fn failures(&self) -> Vec<(&TaskId, &str)> {
        self.exports
            .iter()
            .filter_map(|e| e.error.as_deref().map(|reason| (&e.task_id, reason)))
            .collect()
    }

    /// Tasks whose markers moved and need to be persisted.
    pub fn changed(&self) -> Vec<TaskId> {
        self.exports
            .iter()
            .filter(|e| e.decisions_exported > 0 || e.summary_exported)
            .map(|e| e.task_id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

/// Runs the export protocol against a set of sinks.
#[derive(Clone)]
pub struct Consolidator {
    decisions: Arc<dyn DecisionSink>,
    summaries: Arc<dyn SummarySink>,
    index: Arc<dyn IndexTrigger>,
}

impl Consolidator {
    pub fn new(decisions: Arc<dyn DecisionSink>, summaries: Arc<dyn SummarySink>, index: Arc<dyn IndexTrigger>) -> Self {
        Self {
            decisions,
            summaries,
            index,
        }
    }

    /// File-backed sinks under the given locations.
    pub fn with_files(decisions_dir: PathBuf, summaries_dir: PathBuf, reindex_queue: PathBuf) -> Self {
        Self::new(
            Arc::new(FileDecisionSink::new(decisions_dir)),
            Arc::new(FileSummarySink::new(summaries_dir)),
            Arc::new(FileIndexQueue::new(reindex_queue)),
        )
    }

    /// Completed tasks with material not yet exported.
    pub fn pending(registry: &TaskRegistry) -> Vec<TaskId> {
        registry
            .iter()
            .filter(|t| t.has_pending_export())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Export the given tasks, advancing their markers in place.
    ///
    /// Unknown ids and tasks with nothing pending are skipped.
    pub async fn run(&self, registry: &mut TaskRegistry, ids: &[TaskId], now: DateTime<Utc>) -> ConsolidationReport {
        let mut report = ConsolidationReport::default();
        for id in ids {
            match registry.require_mut(id) {
                Ok(task) if task.has_pending_export() => report.exports.push(self.export_task(task, now).await),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping consolidation of {}: {}", id, e),
            }
        }
        report
    }

    /// Export one completed task, resuming from its marker.
    pub async fn export_task(&self, task: &mut Task, now: DateTime<Utc>) -> TaskExport {
        let mut export = TaskExport {
            task_id: task.id.clone(),
            ..Default::default()
        };
        if !task.has_pending_export() {
            return export;
        }

        while task.export.decisions_exported < task.decisions.len() {
            let seq = task.export.decisions_exported + 1;
            let decision = &task.decisions[seq - 1];
            let result = self.decisions.export_decision(&task.id, seq, decision).await;
            match result {
                Ok(path) => {
                    task.export.decisions_exported += 1;
                    export.decisions_exported += 1;
                    export.paths.extend(path);
                }
                Err(e) => {
                    log::warn!("Decision export failed for {}: {}", task.id, e);
                    export.error = Some(e.to_string());
                    return export;
                }
            }
        }

        if !task.export.summary_exported {
            match self.summaries.export_summary(&task.id, &summary_text(task)).await {
                Ok(path) => {
                    task.export.summary_exported = true;
                    export.summary_exported = true;
                    export.paths.extend(path);
                }
                Err(e) => {
                    log::warn!("Summary export failed for {}: {}", task.id, e);
                    export.error = Some(e.to_string());
                    return export;
                }
            }
        }

        task.export.exported_at = Some(now);
        task.record(TaskEventKind::Exported, now);

        if !export.paths.is_empty() {
            if let Err(e) = self.index.request_reindex(&export.paths).await {
                log::warn!("Reindex request failed for {}: {}", task.id, e);
            }
        }

        log::info!(
            "Consolidated {}: {} decisions, summary {}",
            task.id,
            export.decisions_exported,
            if export.summary_exported { "written" } else { "already present" }
        );
        export
    }
}

/// Markdown summary of a task's session.
pub fn summary_text(task: &Task) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", task.title));
    out.push_str(&format!("- id: {}\n", task.id));
    out.push_str(&format!("- status: {}\n", task.status));
    out.push_str(&format!("- created: {}\n", task.created_at.to_rfc3339()));
    out.push_str(&format!("- last touched: {}\n", task.last_touched_at.to_rfc3339()));
    if task.error_count > 0 {
        out.push_str(&format!("- errors: {}\n", task.error_count));
    }

    if !task.decisions.is_empty() {
        out.push_str("\n## Decisions\n\n");
        for d in &task.decisions {
            out.push_str(&format!("- **{}**: {}\n", d.title, d.rationale));
        }
    }
    if !task.deviations.is_empty() {
        out.push_str("\n## Deviations\n\n");
        for note in &task.deviations {
            out.push_str(&format!("- {}\n", note.text));
        }
    }
    if !task.parked_ideas.is_empty() {
        out.push_str("\n## Parked ideas\n\n");
        for note in &task.parked_ideas {
            out.push_str(&format!("- {}\n", note.text));
        }
    }
    out
}

fn export_error(task_id: &TaskId, action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Export {
        task_id: task_id.clone(),
        reason: format!("failed to {} {}: {}", action, path.display(), e),
    }
}

/// Writes each decision as a markdown record named `<task>-<seq>.md`.
pub struct FileDecisionSink {
    dir: PathBuf,
}

impl FileDecisionSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, task_id: &TaskId, seq: usize) -> PathBuf {
        self.dir.join(format!("{}-{:03}.md", task_id, seq))
    }
}

#[async_trait]
impl DecisionSink for FileDecisionSink {
    async fn export_decision(&self, task_id: &TaskId, seq: usize, decision: &Decision) -> Result<Option<PathBuf>> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| export_error(task_id, "create", &self.dir, e))?;
        let path = self.record_path(task_id, seq);

        let mut body = format!(
            "# {}\n\n- task: {}\n- recorded: {}\n",
            decision.title,
            task_id,
            decision.recorded_at.to_rfc3339()
        );
        if let Some(old) = &decision.supersedes {
            body.push_str(&format!("- supersedes: {}\n", old));
        }
        body.push_str(&format!("\n{}\n", decision.rationale));

        fs::write(&path, body)
            .await
            .map_err(|e| export_error(task_id, "write", &path, e))?;
        Ok(Some(path))
    }
}

/// Writes one markdown summary per task, replacing any earlier one.
pub struct FileSummarySink {
    dir: PathBuf,
}

impl FileSummarySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SummarySink for FileSummarySink {
    async fn export_summary(&self, task_id: &TaskId, summary: &str) -> Result<Option<PathBuf>> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| export_error(task_id, "create", &self.dir, e))?;
        let path = self.dir.join(format!("{}.md", task_id));
        fs::write(&path, summary)
            .await
            .map_err(|e| export_error(task_id, "write", &path, e))?;
        Ok(Some(path))
    }
}

#[derive(Serialize)]
struct ReindexRequest<'a> {
    requested_at: DateTime<Utc>,
    paths: &'a [PathBuf],
}

/// Appends reindex requests as JSON lines for an external indexer to drain.
pub struct FileIndexQueue {
    path: PathBuf,
}

impl FileIndexQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl IndexTrigger for FileIndexQueue {
    async fn request_reindex(&self, paths: &[PathBuf]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(&ReindexRequest {
            requested_at: Utc::now(),
            paths,
        })?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
