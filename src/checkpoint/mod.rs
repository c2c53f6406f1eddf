//! # Checkpoint Store
//!
//! Resumable execution snapshots. A checkpoint captures everything needed to
//! pick a workflow back up after a crash or restart: which tasks completed or
//! failed, the step in flight, the execution context, and per-step results.
//!
//! ## Overview
//!
//! [`CheckpointManager`] owns the "current" checkpoint for a run and talks to
//! a pluggable [`store::CheckpointStore`] backend. Persistence is layered in
//! practice (memory in front of files via
//! [`store::TieredCheckpointStore`]) so a slow disk never blocks a load.
//! Auto-save runs as an independent periodic task; save failures there are
//! logged and the timer keeps going, because a missed snapshot is strictly
//! better than a dead one.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ensemble_core::checkpoint::{CheckpointManager, CheckpointOptions, ExecutionContext};
//! use ensemble_core::checkpoint::store::FileCheckpointStore;
//!
//! async fn demo() -> ensemble_core::Result<()> {
//!     let store = Arc::new(FileCheckpointStore::for_root("."));
//!     let manager = Arc::new(CheckpointManager::new(store));
//!
//!     manager.create_checkpoint(
//!         "release",
//!         ExecutionContext::new("."),
//!         CheckpointOptions::default(),
//!     );
//!     manager.update_checkpoint(
//!         vec!["fetch".to_string()],
//!         vec![],
//!         Some("build".to_string()),
//!         None,
//!     )?;
//!     manager.save().await
//! }
//! ```

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::AgentResult;
use crate::error::{EnsembleError, Result};
use store::CheckpointStore;

/// What to do when a step fails mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandlingMode {
    Stop,
    Continue,
}

/// The inputs a resumed run needs to re-create its environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub repository_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_description: Option<String>,
    /// Outputs of finished steps, keyed by step name, fed into later prompts.
    #[serde(default)]
    pub step_outputs: HashMap<String, String>,
}

impl ExecutionContext {
    pub fn new(repository_root: impl Into<String>) -> Self {
        Self {
            repository_root: repository_root.into(),
            feature_description: None,
            step_outputs: HashMap::new(),
        }
    }

    pub fn with_feature_description(mut self, description: impl Into<String>) -> Self {
        self.feature_description = Some(description.into());
        self
    }
}

/// Run-level settings frozen into the checkpoint at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOptions {
    pub max_concurrency: usize,
    pub error_handling: ErrorHandlingMode,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            error_handling: ErrorHandlingMode::Stop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub repository_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_description: Option<String>,
    pub max_concurrency: usize,
    pub error_handling: ErrorHandlingMode,
}

/// A complete, serializable snapshot of workflow progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub id: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub context: ExecutionContext,
    #[serde(default)]
    pub results: HashMap<String, AgentResult>,
    pub metadata: CheckpointMetadata,
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `checkpoint-{millis}-{7 random base36 chars}`. Sortable by creation time,
/// collision-safe enough for one filesystem.
fn generate_checkpoint_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..7)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("checkpoint-{}-{}", Utc::now().timestamp_millis(), suffix)
}

/// Owns the active checkpoint and the auto-save loop for one run.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    current: Mutex<Option<WorkflowCheckpoint>>,
    autosave: Mutex<Option<watch::Sender<bool>>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
            autosave: Mutex::new(None),
        }
    }

    /// Create a fresh checkpoint for a run and make it current. The context
    /// is captured by value; later mutations by the caller cannot leak in.
    pub fn create_checkpoint(
        &self,
        workflow_name: &str,
        context: ExecutionContext,
        options: CheckpointOptions,
    ) -> WorkflowCheckpoint {
        let now = Utc::now();
        let metadata = CheckpointMetadata {
            repository_root: context.repository_root.clone(),
            feature_description: context.feature_description.clone(),
            max_concurrency: options.max_concurrency,
            error_handling: options.error_handling,
        };
        let checkpoint = WorkflowCheckpoint {
            id: generate_checkpoint_id(),
            workflow_name: workflow_name.to_string(),
            started_at: now,
            last_updated_at: now,
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            current_step: None,
            context,
            results: HashMap::new(),
            metadata,
        };

        info!(
            id = %checkpoint.id,
            workflow = %workflow_name,
            "📝 CHECKPOINT: created"
        );
        *self.current.lock() = Some(checkpoint.clone());
        checkpoint
    }

    /// Mutate the current checkpoint in place. `results` replaces the stored
    /// map only when given.
    pub fn update_checkpoint(
        &self,
        completed_tasks: Vec<String>,
        failed_tasks: Vec<String>,
        current_step: Option<String>,
        results: Option<HashMap<String, AgentResult>>,
    ) -> Result<()> {
        let mut guard = self.current.lock();
        let checkpoint = guard.as_mut().ok_or(EnsembleError::NoActiveCheckpoint)?;

        checkpoint.completed_tasks = completed_tasks;
        checkpoint.failed_tasks = failed_tasks;
        checkpoint.current_step = current_step;
        if let Some(results) = results {
            checkpoint.results = results;
        }
        checkpoint.last_updated_at = Utc::now();
        Ok(())
    }

    /// Persist the current checkpoint through the configured store.
    pub async fn save(&self) -> Result<()> {
        let snapshot = self
            .current
            .lock()
            .clone()
            .ok_or(EnsembleError::NoActiveCheckpoint)?;
        self.store.save(&snapshot).await
    }

    /// Load a checkpoint by id and make it current.
    pub async fn load(&self, id: &str) -> Result<Option<WorkflowCheckpoint>> {
        let loaded = self.store.load(id).await?;
        match &loaded {
            Some(checkpoint) => {
                *self.current.lock() = Some(checkpoint.clone());
                info!(
                    id = %id,
                    workflow = %checkpoint.workflow_name,
                    completed = checkpoint.completed_tasks.len(),
                    "📝 CHECKPOINT: restored"
                );
            }
            None => {
                warn!(id = %id, "📝 CHECKPOINT: not found");
            }
        }
        Ok(loaded)
    }

    pub async fn list(&self) -> Result<Vec<WorkflowCheckpoint>> {
        self.store.list().await
    }

    /// Delete a checkpoint. Clears the current checkpoint if it was the one
    /// deleted.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(id).await?;
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| c.id == id) {
            *current = None;
        }
        Ok(())
    }

    /// Snapshot of the current checkpoint, if any.
    pub fn current(&self) -> Option<WorkflowCheckpoint> {
        self.current.lock().clone()
    }

    /// Start periodic saving of the current checkpoint. Replaces any running
    /// auto-save task. Failures are logged; the timer keeps going.
    pub fn enable_auto_save(self: &Arc<Self>, interval: Duration) {
        self.disable_auto_save();

        let (tx, mut rx) = watch::channel(false);
        *self.autosave.lock() = Some(tx);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; the first save should wait a
            // full interval.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        if manager.current.lock().is_some() {
                            if let Err(error) = manager.save().await {
                                warn!(%error, "📝 CHECKPOINT: auto-save failed");
                            }
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "📝 CHECKPOINT: auto-save enabled");
    }

    pub fn disable_auto_save(&self) {
        if let Some(tx) = self.autosave.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Stop auto-save and attempt one final save of the current checkpoint.
    pub async fn shutdown(&self) {
        self.disable_auto_save();
        if self.current.lock().is_some() {
            match self.save().await {
                Ok(()) => info!("📝 CHECKPOINT: final checkpoint saved on shutdown"),
                Err(error) => warn!(%error, "📝 CHECKPOINT: final save failed on shutdown"),
            }
        }
    }
}
