//! Session boundary tests: briefing, session end, context pressure and recovery.

use std::path::Path;
use std::sync::Arc;

use cogtask::checkpoint::FileCheckpointStore;
use cogtask::config::Config;
use cogtask::consolidation::Consolidator;
use cogtask::{CheckpointReason, ControllerSettings, FileTaskStore, LifecycleController, SpawnRequest, TaskStatus};
use tempfile::TempDir;

fn config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        ..Config::default()
    }
}

async fn open(config: &Config) -> LifecycleController {
    let mut settings = ControllerSettings::from(config);
    settings.checkpoint.every_transitions = 0;
    LifecycleController::open(
        Arc::new(FileTaskStore::new(config.registry_path())),
        Arc::new(FileCheckpointStore::new(config.checkpoint_dir())),
        settings,
    )
    .await
    .expect("open controller")
    .with_consolidator(Consolidator::with_files(
        config.decisions_dir(),
        config.summaries_dir(),
        config.reindex_queue_path(),
    ))
}

#[tokio::test]
async fn test_briefing_after_reopen() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());

    let (writing, urgent) = {
        let mut ctl = open(&config).await;
        let writing = ctl.spawn(SpawnRequest::new("Write chapter").with_activation()).await.unwrap();
        let urgent = ctl
            .spawn(SpawnRequest::new("Reply to reviewer").with_urgency(1.0).with_priority_signal(1.0))
            .await
            .unwrap();
        ctl.spawn(SpawnRequest::new("Waiting on reviewer").blocked_by([urgent.id.clone()]))
            .await
            .unwrap();
        ctl.on_context_pressure().await.unwrap();
        (writing, urgent)
    };

    let mut ctl = open(&config).await;
    let briefing = ctl.on_session_start().await.unwrap();

    assert_eq!(briefing.active.map(|t| t.id), Some(writing.id.clone()));
    assert_eq!(briefing.next, Some(urgent.id.clone()));
    assert_eq!(briefing.ranked.len(), 3);
    assert_eq!(briefing.counts.live(), 3);
    assert_eq!(briefing.pending_consolidation, 0);
    assert!(briefing.pool.iter().any(|e| e.task_id == writing.id));
    assert!(briefing.repaired.is_empty());

    let checkpoint = briefing.latest_checkpoint.expect("pressure checkpoint");
    assert_eq!(checkpoint.reason, CheckpointReason::ContextPressure);
    assert_eq!(checkpoint.task_count, 3);
}

#[tokio::test]
async fn test_session_end_exports_and_checkpoints() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let mut ctl = open(&config).await;

    let task = ctl.spawn(SpawnRequest::new("Ship release").with_activation()).await.unwrap();
    ctl.record_decision(&task.id, "Tag from main", "release branch is stale", None)
        .await
        .unwrap();
    ctl.complete(&task.id).await.unwrap();
    // Already exported at completion
    assert_eq!(ctl.pending_consolidation(), 0);

    let end = ctl.on_session_end().await.unwrap();
    assert!(end.consolidation.is_empty());
    assert_eq!(end.checkpoint.reason, CheckpointReason::SessionEnd);
    assert_eq!(end.checkpoint.task_count, 1);

    assert!(config.summaries_dir().join(format!("{}.md", task.id)).exists());
    let files: Vec<_> = std::fs::read_dir(config.checkpoint_dir()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn test_recover_rolls_back_to_checkpoint() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let mut ctl = open(&config).await;

    let task = ctl.spawn(SpawnRequest::new("Refactor parser")).await.unwrap();
    ctl.on_context_pressure().await.unwrap();

    ctl.switch(&task.id).await.unwrap();
    ctl.cancel(&task.id).await.unwrap();
    let late = ctl.spawn(SpawnRequest::new("Spawned after checkpoint")).await.unwrap();

    let summary = ctl.recover().await.unwrap();
    assert_eq!(summary.reason, CheckpointReason::ContextPressure);

    assert_eq!(ctl.get(&task.id).unwrap().status, TaskStatus::Paused);
    assert!(ctl.active_id().is_none());
    // Tasks created after the checkpoint are kept
    assert!(ctl.get(&late.id).is_ok());

    // The restored state is what a fresh process sees
    let reopened = open(&config).await;
    assert_eq!(reopened.get(&task.id).unwrap().status, TaskStatus::Paused);
    assert_eq!(reopened.registry().len(), 2);
}
