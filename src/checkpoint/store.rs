//! # Checkpoint Storage Backends
//!
//! Pluggable persistence for workflow checkpoints: a JSON-file store for
//! durability, an in-memory store for tests and layering, and a tiered store
//! that fans writes out across backends. The manager in the parent module
//! only ever sees the [`CheckpointStore`] trait.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::checkpoint::WorkflowCheckpoint;
use crate::error::{EnsembleError, Result};

/// Persistence contract for checkpoints. `load` returning `Ok(None)` means
/// "not found"; corrupt data is also reported as `Ok(None)` after logging,
/// because a checkpoint that cannot be read is as good as absent.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<WorkflowCheckpoint>>;
    async fn list(&self) -> Result<Vec<WorkflowCheckpoint>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// One `<id>.json` per checkpoint under a directory, conventionally
/// `<root>/.ensemble/checkpoints`.
pub struct FileCheckpointStore {
    dir: PathBuf,
    io_timeout: Duration,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            io_timeout: Duration::from_secs(5),
        }
    }

    /// Store under the conventional `<root>/.ensemble/checkpoints` location.
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        Self::new(root.as_ref().join(".ensemble").join("checkpoints"))
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    fn checkpoint_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.checkpoint_path(&checkpoint.id);
        let json = serde_json::to_vec_pretty(checkpoint)?;

        match tokio::time::timeout(self.io_timeout, tokio::fs::write(&path, json)).await {
            Ok(Ok(())) => {
                debug!(id = %checkpoint.id, path = %path.display(), "📝 CHECKPOINT: saved to disk");
                Ok(())
            }
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(EnsembleError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("checkpoint write timed out after {:?}", self.io_timeout),
            ))),
        }
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowCheckpoint>> {
        let path = self.checkpoint_path(id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        match serde_json::from_slice(&data) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(error) => {
                warn!(id = %id, path = %path.display(), %error, "📝 CHECKPOINT: corrupt checkpoint file");
                Ok(None)
            }
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowCheckpoint>> {
        let mut checkpoints = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(checkpoints)
            }
            Err(error) => return Err(error.into()),
        };

        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = tokio::fs::read(&path).await else {
                continue;
            };
            match serde_json::from_slice::<WorkflowCheckpoint>(&data) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(error) => {
                    warn!(path = %path.display(), %error, "📝 CHECKPOINT: skipping unreadable file");
                }
            }
        }

        checkpoints.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        Ok(checkpoints)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.checkpoint_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// In-process store, primarily for tests and as the fast layer of a tiered
/// setup.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<String, WorkflowCheckpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        self.entries
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowCheckpoint>> {
        Ok(self.entries.get(id).map(|e| e.value().clone()))
    }

    async fn list(&self) -> Result<Vec<WorkflowCheckpoint>> {
        let mut checkpoints: Vec<WorkflowCheckpoint> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        checkpoints.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        Ok(checkpoints)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.remove(id);
        Ok(())
    }
}

/// Layered persistence. Saves fan out to every backend concurrently and
/// succeed if any backend accepts; loads try backends in the order given
/// (fastest first by convention).
pub struct TieredCheckpointStore {
    stores: Vec<Arc<dyn CheckpointStore>>,
}

impl TieredCheckpointStore {
    pub fn new(stores: Vec<Arc<dyn CheckpointStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl CheckpointStore for TieredCheckpointStore {
    async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        if self.stores.is_empty() {
            return Err(EnsembleError::CheckpointSaveFailed(
                "no backends configured".to_string(),
            ));
        }

        let results = join_all(self.stores.iter().map(|s| s.save(checkpoint))).await;
        let mut failures = Vec::new();
        for result in &results {
            if let Err(error) = result {
                failures.push(error.to_string());
            }
        }

        if failures.len() == results.len() {
            return Err(EnsembleError::CheckpointSaveFailed(failures.join("; ")));
        }
        if !failures.is_empty() {
            warn!(
                id = %checkpoint.id,
                failed = failures.len(),
                total = results.len(),
                "📝 CHECKPOINT: some backends rejected the save"
            );
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowCheckpoint>> {
        for store in &self.stores {
            match store.load(id).await {
                Ok(Some(checkpoint)) => return Ok(Some(checkpoint)),
                Ok(None) => continue,
                Err(error) => {
                    warn!(id = %id, %error, "📝 CHECKPOINT: backend load failed, trying next");
                }
            }
        }
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<WorkflowCheckpoint>> {
        let mut merged: Vec<WorkflowCheckpoint> = Vec::new();
        for store in &self.stores {
            match store.list().await {
                Ok(checkpoints) => {
                    for checkpoint in checkpoints {
                        if !merged.iter().any(|c| c.id == checkpoint.id) {
                            merged.push(checkpoint);
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "📝 CHECKPOINT: backend list failed, merging the rest");
                }
            }
        }
        merged.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        Ok(merged)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let results = join_all(self.stores.iter().map(|s| s.delete(id))).await;
        let failures: Vec<String> = results
            .iter()
            .filter_map(|r| r.as_ref().err().map(ToString::to_string))
            .collect();

        if !self.stores.is_empty() && failures.len() == self.stores.len() {
            return Err(EnsembleError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "all backends failed to delete checkpoint '{id}': {}",
                    failures.join("; ")
                ),
            )));
        }
        Ok(())
    }
}
