//! # Result Cache
//!
//! Content-addressed memoization of successful agent results, with a bounded
//! in-memory LRU tier in front of a JSON-file disk tier.
//!
//! ## Overview
//!
//! The cache key is a SHA-256 digest over the canonical JSON of the fields
//! that determine an invocation's outcome: step name, role, description, and
//! the first 1000 characters of the prompt. Identical work is recognized
//! across process restarts because the disk tier lives under
//! `<root>/.ensemble/cache`, one `<hash>.json` file per entry.
//!
//! Failures are never cached, and stale or failed entries found on the read
//! path are deleted and reported as misses. Caching is an optimization:
//! every storage error on this path is logged and degrades to a miss or a
//! no-op, never an error for the caller.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{AgentResult, TaskSpec};

/// How much of the prompt participates in the cache key.
const PROMPT_HASH_CHARS: usize = 1000;
/// How much of the prompt is stored as entry metadata.
const PROMPT_METADATA_CHARS: usize = 500;

/// Cache tuning. `cache_dir` is derived from the repository root by
/// [`CacheConfig::for_root`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub memory_limit: usize,
    pub disk_limit: usize,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
    pub io_timeout: Duration,
    pub cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_limit: 100,
            disk_limit: 1000,
            default_ttl: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(300),
            io_timeout: Duration::from_secs(5),
            cache_dir: PathBuf::from(".ensemble/cache"),
        }
    }
}

impl CacheConfig {
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: root.as_ref().join(".ensemble").join("cache"),
            ..Default::default()
        }
    }
}

/// One cached result. Serialized verbatim to `<task_hash>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub task_hash: String,
    pub step_name: String,
    pub result: AgentResult,
    pub cached_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: CacheMetadata,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}

/// Provenance stored alongside the result for debugging cache contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub role: String,
    pub prompt: String,
}

/// Point-in-time cache occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub total_size_bytes: u64,
}

/// Memory tier: entries plus access order, oldest at the front.
struct MemoryTier {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl MemoryTier {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn insert(&mut self, key: String, entry: CacheEntry, limit: usize) {
        self.entries.insert(key.clone(), entry);
        self.touch(&key);
        while self.entries.len() > limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                debug!(evicted = %oldest, "💾 RESULT CACHE: evicted LRU memory entry");
            } else {
                break;
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }

    fn remove_step(&mut self, step_name: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.step_name == step_name)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Two-tier result cache. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct ResultCache {
    config: CacheConfig,
    memory: Mutex<MemoryTier>,
    last_cleanup: Mutex<Option<Instant>>,
    sweeper: Mutex<Option<watch::Sender<bool>>>,
}

impl ResultCache {
    /// Cache rooted at `<repository_root>/.ensemble/cache` with default
    /// limits.
    pub fn new(repository_root: impl AsRef<Path>) -> Self {
        Self::with_config(CacheConfig::for_root(repository_root))
    }

    pub fn with_config(config: CacheConfig) -> Self {
        if config.enabled {
            if let Err(error) = std::fs::create_dir_all(&config.cache_dir) {
                warn!(
                    dir = %config.cache_dir.display(),
                    %error,
                    "💾 RESULT CACHE: could not create cache directory, disk tier degraded"
                );
            }
        }
        Self {
            config,
            memory: Mutex::new(MemoryTier::new()),
            last_cleanup: Mutex::new(None),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Content hash identifying this invocation for cache purposes.
    pub fn cache_key(task: &TaskSpec, prompt: &str) -> String {
        let prefix = truncate_chars(prompt, PROMPT_HASH_CHARS);
        let payload = serde_json::json!({
            "step_name": task.step_name,
            "role": task.role,
            "description": task.description,
            "prompt": prefix,
        });
        hex::encode(Sha256::digest(payload.to_string().as_bytes()))
    }

    /// Look up a previous successful result for this task + prompt.
    ///
    /// Expired and failed entries encountered here are removed and treated as
    /// misses. A disk hit is promoted into the memory tier.
    pub async fn get(&self, task: &TaskSpec, prompt: &str) -> Option<AgentResult> {
        if !self.config.enabled {
            return None;
        }
        let key = Self::cache_key(task, prompt);
        let now = Utc::now();

        {
            let mut memory = self.memory.lock();
            if let Some(entry) = memory.entries.get(&key) {
                if entry.is_expired(now) {
                    memory.remove(&key);
                    debug!(step = %task.step_name, "💾 RESULT CACHE: memory entry expired");
                    return None;
                }
                if !entry.result.success {
                    memory.remove(&key);
                    return None;
                }
                let result = entry.result.clone();
                memory.touch(&key);
                debug!(step = %task.step_name, "💾 RESULT CACHE: memory hit");
                return Some(result);
            }
        }

        let path = self.entry_path(&key);
        let data = match tokio::time::timeout(self.config.io_timeout, tokio::fs::read(&path)).await
        {
            Ok(Ok(data)) => data,
            Ok(Err(error)) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Ok(Err(error)) => {
                warn!(path = %path.display(), %error, "💾 RESULT CACHE: disk read failed");
                return None;
            }
            Err(_) => {
                warn!(path = %path.display(), "💾 RESULT CACHE: disk read timed out");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&data) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(path = %path.display(), %error, "💾 RESULT CACHE: unreadable cache file");
                return None;
            }
        };

        if entry.is_expired(now) || !entry.result.success {
            if let Err(error) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), %error, "💾 RESULT CACHE: stale file removal failed");
            }
            return None;
        }

        let result = entry.result.clone();
        self.memory
            .lock()
            .insert(key, entry, self.config.memory_limit);
        debug!(step = %task.step_name, "💾 RESULT CACHE: disk hit, promoted to memory");
        Some(result)
    }

    /// Store a successful result in both tiers. Failed results are ignored.
    pub async fn set(
        &self,
        task: &TaskSpec,
        prompt: &str,
        result: &AgentResult,
        ttl: Option<Duration>,
    ) {
        if !self.config.enabled {
            return;
        }
        if !result.success {
            debug!(step = %task.step_name, "💾 RESULT CACHE: skipping failed result");
            return;
        }

        let key = Self::cache_key(task, prompt);
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry {
            task_hash: key.clone(),
            step_name: task.step_name.clone(),
            result: result.clone(),
            cached_at: now,
            expires_at: Some(now + chrono::Duration::milliseconds(ttl.as_millis() as i64)),
            metadata: CacheMetadata {
                role: task.role.clone(),
                prompt: truncate_chars(prompt, PROMPT_METADATA_CHARS),
            },
        };

        self.memory
            .lock()
            .insert(key.clone(), entry.clone(), self.config.memory_limit);

        let path = self.entry_path(&key);
        let write = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let json = serde_json::to_vec_pretty(&entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            tokio::fs::write(&path, json).await
        };
        match tokio::time::timeout(self.config.io_timeout, write).await {
            Ok(Ok(())) => {
                debug!(step = %task.step_name, hash = %key, "💾 RESULT CACHE: stored result");
            }
            Ok(Err(error)) => {
                warn!(path = %path.display(), %error, "💾 RESULT CACHE: disk write failed");
            }
            Err(_) => {
                warn!(path = %path.display(), "💾 RESULT CACHE: disk write timed out");
            }
        }

        self.maybe_schedule_cleanup();
    }

    /// Drop every entry cached for a step, in both tiers. Returns how many
    /// entries were removed.
    pub async fn invalidate(&self, step_name: &str) -> usize {
        let mut removed = self.memory.lock().remove_step(step_name);

        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.cache_dir).await {
            while let Ok(Some(file)) = dir.next_entry().await {
                let path = file.path();
                if !is_cache_file(&path) {
                    continue;
                }
                let Ok(data) = tokio::fs::read(&path).await else {
                    continue;
                };
                let Ok(entry) = serde_json::from_slice::<CacheEntry>(&data) else {
                    continue;
                };
                if entry.step_name == step_name && tokio::fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                }
            }
        }

        info!(step = %step_name, removed, "💾 RESULT CACHE: invalidated entries");
        removed
    }

    /// Wipe both tiers.
    pub async fn clear(&self) {
        self.memory.lock().clear();
        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.cache_dir).await {
            while let Ok(Some(file)) = dir.next_entry().await {
                let path = file.path();
                if is_cache_file(&path) {
                    if let Err(error) = tokio::fs::remove_file(&path).await {
                        debug!(path = %path.display(), %error, "💾 RESULT CACHE: clear skipped file");
                    }
                }
            }
        }
        info!("💾 RESULT CACHE: cleared");
    }

    /// Current occupancy of both tiers.
    pub async fn stats(&self) -> CacheStats {
        let memory_entries = self.memory.lock().entries.len();
        let mut disk_entries = 0usize;
        let mut total_size_bytes = 0u64;

        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.cache_dir).await {
            while let Ok(Some(file)) = dir.next_entry().await {
                if !is_cache_file(&file.path()) {
                    continue;
                }
                disk_entries += 1;
                if let Ok(meta) = file.metadata().await {
                    total_size_bytes += meta.len();
                }
            }
        }

        CacheStats {
            total_entries: memory_entries.max(disk_entries),
            memory_entries,
            disk_entries,
            total_size_bytes,
        }
    }

    /// Spawn the periodic disk sweeper. Idempotent; the task exits when
    /// [`ResultCache::stop_sweeper`] is called or the cache is dropped.
    pub fn start_sweeper(&self) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cleanup_interval);
            // The immediate first tick would sweep an empty cache.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => run_cleanup(config.clone()).await,
                    _ = rx.changed() => break,
                }
            }
        });
        *guard = Some(tx);
    }

    pub fn stop_sweeper(&self) {
        if let Some(tx) = self.sweeper.lock().take() {
            let _ = tx.send(true);
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.config.cache_dir.join(format!("{key}.json"))
    }

    /// Cleanup runs off the write path, at most once per interval.
    fn maybe_schedule_cleanup(&self) {
        let due = {
            let mut last = self.last_cleanup.lock();
            match *last {
                Some(at) if at.elapsed() < self.config.cleanup_interval => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if due {
            tokio::spawn(run_cleanup(self.config.clone()));
        }
    }
}

fn is_cache_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Delete expired and unreadable entries, then enforce the disk cap by
/// removing the oldest files.
async fn run_cleanup(config: CacheConfig) {
    let Ok(mut dir) = tokio::fs::read_dir(&config.cache_dir).await else {
        return;
    };

    let now = Utc::now();
    let mut removed = 0usize;
    let mut live: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

    while let Ok(Some(file)) = dir.next_entry().await {
        let path = file.path();
        if !is_cache_file(&path) {
            continue;
        }

        let stale = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<CacheEntry>(&data) {
                Ok(entry) => entry.is_expired(now),
                Err(_) => true,
            },
            Err(_) => continue,
        };

        if stale {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
            continue;
        }

        let modified = file
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        live.push((path, modified));
    }

    if live.len() > config.disk_limit {
        live.sort_by_key(|(_, modified)| *modified);
        let excess = live.len() - config.disk_limit;
        for (path, _) in live.drain(..excess) {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
    }

    if removed > 0 {
        debug!(removed, "💾 RESULT CACHE: cleanup removed stale entries");
    }
}
