//! Checkpoint persistence: lossless round-trips through the file store,
//! tiered fan-out and fallback, auto-save, and the resume flow back into the
//! scheduler.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_test::assert_ok;

use ensemble_core::agent::AgentResult;
use ensemble_core::checkpoint::store::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, TieredCheckpointStore,
};
use ensemble_core::checkpoint::{
    CheckpointManager, CheckpointOptions, ErrorHandlingMode, ExecutionContext, WorkflowCheckpoint,
};
use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::scheduler::SprintScheduler;
use ensemble_core::workflow::ExecutionStatus;

use common::{pipeline_workflow, RecordingHandler};

fn rich_context() -> ExecutionContext {
    let mut context = ExecutionContext::new("/repo").with_feature_description("add a parser");
    context
        .step_outputs
        .insert("fetch".to_string(), "sources at /tmp/src".to_string());
    context
        .step_outputs
        .insert("build".to_string(), "artifacts at /tmp/out".to_string());
    context
}

fn rich_results() -> HashMap<String, AgentResult> {
    let mut results = HashMap::new();
    results.insert(
        "fetch".to_string(),
        AgentResult::ok("fetched").with_output("/tmp/src"),
    );
    results.insert("build".to_string(), AgentResult::ok("built"));
    results
}

#[tokio::test]
async fn test_file_store_roundtrip_is_lossless() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(CheckpointManager::new(Arc::new(FileCheckpointStore::new(
        dir.path(),
    ))));

    let created = manager.create_checkpoint(
        "release",
        rich_context(),
        CheckpointOptions {
            max_concurrency: 8,
            error_handling: ErrorHandlingMode::Continue,
        },
    );
    manager
        .update_checkpoint(
            vec!["fetch".to_string(), "build".to_string()],
            vec!["lint".to_string()],
            Some("test".to_string()),
            Some(rich_results()),
        )
        .unwrap();
    assert_ok!(manager.save().await);

    let snapshot = manager.current().unwrap();
    let loaded = manager.load(&created.id).await.unwrap().unwrap();

    // Deep equality, timestamps included: the serialized form must
    // round-trip to the same instants and the same associative content.
    assert_eq!(loaded, snapshot);
    assert_eq!(loaded.completed_tasks, vec!["fetch", "build"]);
    assert_eq!(loaded.failed_tasks, vec!["lint"]);
    assert_eq!(loaded.context.step_outputs.len(), 2);
    assert_eq!(loaded.results["fetch"].output.as_deref(), Some("/tmp/src"));
    assert_eq!(loaded.metadata.max_concurrency, 8);
    assert_eq!(loaded.metadata.error_handling, ErrorHandlingMode::Continue);
    assert_eq!(loaded.started_at, snapshot.started_at);
    assert_eq!(loaded.last_updated_at, snapshot.last_updated_at);

    // Persisted as <id>.json.
    assert!(dir.path().join(format!("{}.json", created.id)).exists());
}

#[tokio::test]
async fn test_list_is_newest_first_and_delete_removes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    let manager = Arc::new(CheckpointManager::new(store));

    let first = manager.create_checkpoint("one", ExecutionContext::new("."), CheckpointOptions::default());
    assert_ok!(manager.save().await);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = manager.create_checkpoint("two", ExecutionContext::new("."), CheckpointOptions::default());
    assert_ok!(manager.save().await);

    let listed = manager.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);

    assert_ok!(manager.delete(&first.id).await);
    let listed = manager.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.id);
}

#[tokio::test]
async fn test_corrupt_checkpoint_file_reads_as_absent() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("checkpoint-1-abcdefg.json"), b"{not json").unwrap();

    let store = FileCheckpointStore::new(dir.path());
    assert!(store.load("checkpoint-1-abcdefg").await.unwrap().is_none());
    assert!(store.list().await.unwrap().is_empty());
}

struct RejectingStore;

#[async_trait]
impl CheckpointStore for RejectingStore {
    async fn save(&self, _checkpoint: &WorkflowCheckpoint) -> Result<()> {
        Err(EnsembleError::Configuration("backend offline".to_string()))
    }

    async fn load(&self, _id: &str) -> Result<Option<WorkflowCheckpoint>> {
        Err(EnsembleError::Configuration("backend offline".to_string()))
    }

    async fn list(&self) -> Result<Vec<WorkflowCheckpoint>> {
        Err(EnsembleError::Configuration("backend offline".to_string()))
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Err(EnsembleError::Configuration("backend offline".to_string()))
    }
}

#[tokio::test]
async fn test_tiered_save_succeeds_when_any_backend_accepts() {
    let healthy = Arc::new(MemoryCheckpointStore::new());
    let tiered = TieredCheckpointStore::new(vec![
        Arc::new(RejectingStore) as Arc<dyn CheckpointStore>,
        Arc::clone(&healthy) as Arc<dyn CheckpointStore>,
    ]);
    let manager = Arc::new(CheckpointManager::new(Arc::new(tiered)));

    let checkpoint =
        manager.create_checkpoint("wf", ExecutionContext::new("."), CheckpointOptions::default());
    assert_ok!(manager.save().await);
    assert_eq!(healthy.len(), 1);

    // Load skips the failing backend and finds the copy in the healthy one.
    let loaded = manager.load(&checkpoint.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, checkpoint.id);
}

#[tokio::test]
async fn test_tiered_save_fails_only_when_all_backends_fail() {
    let tiered = TieredCheckpointStore::new(vec![
        Arc::new(RejectingStore) as Arc<dyn CheckpointStore>,
        Arc::new(RejectingStore) as Arc<dyn CheckpointStore>,
    ]);
    let manager = Arc::new(CheckpointManager::new(Arc::new(tiered)));

    manager.create_checkpoint("wf", ExecutionContext::new("."), CheckpointOptions::default());
    assert!(matches!(
        manager.save().await.unwrap_err(),
        EnsembleError::CheckpointSaveFailed(_)
    ));
}

#[tokio::test]
async fn test_tiered_load_prefers_first_backend() {
    let fast = Arc::new(MemoryCheckpointStore::new());
    let slow = Arc::new(MemoryCheckpointStore::new());

    let seed_manager = CheckpointManager::new(Arc::clone(&fast) as Arc<dyn CheckpointStore>);
    let mut in_fast =
        seed_manager.create_checkpoint("wf", ExecutionContext::new("."), CheckpointOptions::default());
    assert_ok!(seed_manager.save().await);

    // Same id in the slow tier but stale content.
    in_fast.current_step = Some("stale".to_string());
    slow.save(&in_fast).await.unwrap();

    let tiered = TieredCheckpointStore::new(vec![
        Arc::clone(&fast) as Arc<dyn CheckpointStore>,
        Arc::clone(&slow) as Arc<dyn CheckpointStore>,
    ]);
    let loaded = tiered.load(&in_fast.id).await.unwrap().unwrap();
    assert_eq!(loaded.current_step, None, "first backend wins");
}

#[tokio::test(start_paused = true)]
async fn test_auto_save_persists_periodically_and_survives_failures() {
    let healthy = Arc::new(MemoryCheckpointStore::new());
    let tiered = TieredCheckpointStore::new(vec![
        Arc::new(RejectingStore) as Arc<dyn CheckpointStore>,
        Arc::clone(&healthy) as Arc<dyn CheckpointStore>,
    ]);
    let manager = Arc::new(CheckpointManager::new(Arc::new(tiered)));

    manager.create_checkpoint("wf", ExecutionContext::new("."), CheckpointOptions::default());
    manager.enable_auto_save(Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(healthy.len(), 1);

    manager
        .update_checkpoint(vec!["fetch".to_string()], vec![], None, None)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let listed = healthy.list().await.unwrap();
    assert_eq!(listed[0].completed_tasks, vec!["fetch"]);

    manager.disable_auto_save();
}

#[tokio::test]
async fn test_shutdown_makes_a_final_save() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let manager = Arc::new(CheckpointManager::new(
        Arc::clone(&store) as Arc<dyn CheckpointStore>
    ));

    manager.create_checkpoint("wf", ExecutionContext::new("."), CheckpointOptions::default());
    manager
        .update_checkpoint(vec!["fetch".to_string()], vec![], Some("build".to_string()), None)
        .unwrap();

    manager.shutdown().await;
    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].current_step.as_deref(), Some("build"));
}

#[tokio::test]
async fn test_resume_flow_skips_completed_steps() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(CheckpointManager::new(Arc::new(FileCheckpointStore::new(
        dir.path(),
    ))));

    // A previous run finished fetch, then stopped.
    let checkpoint =
        manager.create_checkpoint("pipeline", rich_context(), CheckpointOptions::default());
    manager
        .update_checkpoint(vec!["fetch".to_string()], vec![], Some("build".to_string()), None)
        .unwrap();
    assert_ok!(manager.save().await);

    // New process: load the checkpoint, replay completion into the scheduler.
    let resumed = manager.load(&checkpoint.id).await.unwrap().unwrap();
    let scheduler = SprintScheduler::default();
    let handler = RecordingHandler::new();
    scheduler
        .start_monitoring(pipeline_workflow("pipeline"), Arc::clone(&handler) as _)
        .unwrap();
    for step in &resumed.completed_tasks {
        scheduler.update_step_status("pipeline", step, ExecutionStatus::Completed);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The first sprint goes straight to build; fetch is never re-assigned.
    assert_eq!(handler.assigned_steps(), ["build"]);
    // Prior outputs are available as context for the new run's prompts.
    assert_eq!(
        resumed.context.step_outputs["fetch"],
        "sources at /tmp/src"
    );
}
