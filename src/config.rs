//! # Engine Configuration
//!
//! Typed configuration for every component of the engine, loadable from
//! environment-aware YAML files.
//!
//! ## Overview
//!
//! [`EnsembleConfig`] carries one section per component; every field has a
//! default matching the component's own `Default`, so an empty file (or no
//! file at all) yields a fully working engine. [`ConfigLoader`] discovers
//! `ensemble.yaml` in a config directory, deep-merges an optional
//! `ensemble-{environment}.yaml` overlay on top, deserializes, and validates.
//! Environment detection checks `ENSEMBLE_ENV`, then `APP_ENV`, then falls
//! back to `development`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ensemble_core::config::{ConfigLoader, EnsembleConfig};
//!
//! fn demo() -> ensemble_core::Result<()> {
//!     let config: EnsembleConfig = ConfigLoader::new("config").load()?;
//!     println!("sprint interval: {:?}", config.scheduler.sprint_interval());
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use tracing::debug;

use crate::cache::CacheConfig;
use crate::checkpoint::{CheckpointOptions, ErrorHandlingMode};
use crate::concurrency::ConcurrencyConfig;
use crate::error::{EnsembleError, Result};
use crate::retry::{ErrorKind, RetryPolicy};
use crate::scheduler::SchedulerConfig;

/// Root configuration document, one section per component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub execution: ExecutionSettings,
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub checkpoint: CheckpointSettings,
    pub concurrency: ConcurrencySettings,
}

impl EnsembleConfig {
    /// Cross-field sanity checks, run after deserialization.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.sprint_interval_secs == 0 {
            return Err(EnsembleError::Configuration(
                "scheduler.sprint_interval_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.default_agent.trim().is_empty() {
            return Err(EnsembleError::Configuration(
                "scheduler.default_agent must not be empty".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(EnsembleError::Configuration(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(EnsembleError::Configuration(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.cache.memory_limit == 0 || self.cache.disk_limit == 0 {
            return Err(EnsembleError::Configuration(
                "cache limits must be positive".to_string(),
            ));
        }
        if self.concurrency.min_concurrency == 0 {
            return Err(EnsembleError::Configuration(
                "concurrency.min_concurrency must be at least 1".to_string(),
            ));
        }
        if self.concurrency.max_concurrency < self.concurrency.min_concurrency {
            return Err(EnsembleError::Configuration(format!(
                "concurrency.max_concurrency ({}) is below min_concurrency ({})",
                self.concurrency.max_concurrency, self.concurrency.min_concurrency
            )));
        }
        Ok(())
    }

    /// Checkpoint run options derived from the execution and concurrency
    /// sections.
    pub fn checkpoint_options(&self) -> CheckpointOptions {
        CheckpointOptions {
            max_concurrency: self.concurrency.max_concurrency,
            error_handling: self.execution.error_handling,
        }
    }
}

/// Run-level execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Root of the repository the agents operate on; persistence lives under
    /// `.ensemble/` inside it.
    pub repository_root: String,
    pub error_handling: ErrorHandlingMode,
    /// Seconds between the cancellation signal and forced termination.
    pub agent_grace_period_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            repository_root: ".".to_string(),
            error_handling: ErrorHandlingMode::Stop,
            agent_grace_period_secs: 5,
        }
    }
}

impl ExecutionSettings {
    pub fn agent_grace_period(&self) -> Duration {
        Duration::from_secs(self.agent_grace_period_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub sprint_interval_secs: u64,
    pub default_agent: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let base = SchedulerConfig::default();
        Self {
            sprint_interval_secs: base.sprint_interval.as_secs(),
            default_agent: base.default_agent,
        }
    }
}

impl SchedulerSettings {
    pub fn sprint_interval(&self) -> Duration {
        Duration::from_secs(self.sprint_interval_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sprint_interval: self.sprint_interval(),
            default_agent: self.default_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let base = RetryPolicy::default();
        let mut retryable: Vec<ErrorKind> = base.retryable.iter().copied().collect();
        retryable.sort_by_key(|kind| kind.to_string());
        Self {
            max_retries: base.max_retries,
            initial_delay_ms: base.initial_delay.as_millis() as u64,
            max_delay_ms: base.max_delay.as_millis() as u64,
            backoff_multiplier: base.backoff_multiplier,
            jitter: base.jitter,
            retryable,
        }
    }
}

impl RetrySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
            retryable: self.retryable.iter().copied().collect::<HashSet<_>>(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub memory_limit: usize,
    pub disk_limit: usize,
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub io_timeout_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let base = CacheConfig::default();
        Self {
            enabled: base.enabled,
            memory_limit: base.memory_limit,
            disk_limit: base.disk_limit,
            ttl_secs: base.default_ttl.as_secs(),
            cleanup_interval_secs: base.cleanup_interval.as_secs(),
            io_timeout_secs: base.io_timeout.as_secs(),
        }
    }
}

impl CacheSettings {
    /// Materialize a [`CacheConfig`] rooted at the given repository root.
    pub fn cache_config(&self, repository_root: impl AsRef<Path>) -> CacheConfig {
        CacheConfig {
            enabled: self.enabled,
            memory_limit: self.memory_limit,
            disk_limit: self.disk_limit,
            default_ttl: Duration::from_secs(self.ttl_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            ..CacheConfig::for_root(repository_root)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub auto_save: bool,
    pub auto_save_interval_secs: u64,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            auto_save: true,
            auto_save_interval_secs: 60,
        }
    }
}

impl CheckpointSettings {
    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    pub max_concurrency: usize,
    pub min_concurrency: usize,
    pub window_capacity: usize,
    pub recent_sample_count: usize,
    pub min_samples: usize,
    pub fast_threshold_ms: u64,
    pub slow_threshold_ms: u64,
    pub high_success_rate: f64,
    pub low_success_rate: f64,
    pub default_estimate_ms: u64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        let base = ConcurrencyConfig::default();
        Self {
            max_concurrency: base.max_concurrency,
            min_concurrency: base.min_concurrency,
            window_capacity: base.window_capacity,
            recent_sample_count: base.recent_sample_count,
            min_samples: base.min_samples,
            fast_threshold_ms: base.fast_threshold.as_millis() as u64,
            slow_threshold_ms: base.slow_threshold.as_millis() as u64,
            high_success_rate: base.high_success_rate,
            low_success_rate: base.low_success_rate,
            default_estimate_ms: base.default_estimate.as_millis() as u64,
        }
    }
}

impl ConcurrencySettings {
    pub fn concurrency_config(&self) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_concurrency: self.max_concurrency,
            min_concurrency: self.min_concurrency,
            window_capacity: self.window_capacity,
            recent_sample_count: self.recent_sample_count,
            min_samples: self.min_samples,
            fast_threshold: Duration::from_millis(self.fast_threshold_ms),
            slow_threshold: Duration::from_millis(self.slow_threshold_ms),
            high_success_rate: self.high_success_rate,
            low_success_rate: self.low_success_rate,
            default_estimate: Duration::from_millis(self.default_estimate_ms),
        }
    }
}

/// Environment-aware YAML loader: `ensemble.yaml` plus an optional
/// `ensemble-{environment}.yaml` overlay, deep-merged before deserialization.
pub struct ConfigLoader {
    config_dir: PathBuf,
    environment: String,
}

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment: detect_environment(),
        }
    }

    /// Override the detected environment, mainly for tests that must not
    /// mutate process-wide environment variables.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Load, merge, deserialize, and validate.
    ///
    /// A missing base file is not an error: the defaults stand in, so a
    /// project can run with no config directory at all.
    pub fn load(&self) -> Result<EnsembleConfig> {
        let base_path = self.config_dir.join("ensemble.yaml");
        let overlay_path = self
            .config_dir
            .join(format!("ensemble-{}.yaml", self.environment));

        let mut merged = if base_path.exists() {
            read_yaml(&base_path)?
        } else {
            debug!(
                path = %base_path.display(),
                "⚙️ CONFIG: no base config file, using defaults"
            );
            YamlValue::Mapping(serde_yaml::Mapping::new())
        };

        if overlay_path.exists() {
            let overlay = read_yaml(&overlay_path)?;
            merge_yaml(&mut merged, overlay);
            debug!(
                environment = %self.environment,
                path = %overlay_path.display(),
                "⚙️ CONFIG: environment overlay applied"
            );
        }

        let config: EnsembleConfig = serde_yaml::from_value(merged)?;
        config.validate()?;

        debug!(
            environment = %self.environment,
            sprint_interval_secs = config.scheduler.sprint_interval_secs,
            max_concurrency = config.concurrency.max_concurrency,
            "⚙️ CONFIG: loaded"
        );
        Ok(config)
    }
}

fn detect_environment() -> String {
    std::env::var("ENSEMBLE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}

fn read_yaml(path: &Path) -> Result<YamlValue> {
    let raw = std::fs::read_to_string(path).map_err(|source| EnsembleError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&raw)?)
}

/// Recursive mapping merge: overlay mappings merge key-by-key, everything
/// else replaces wholesale.
fn merge_yaml(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
