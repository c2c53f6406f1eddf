//! # Adaptive Concurrency Controller
//!
//! Decides how many agent tasks should run in parallel based on a rolling
//! window of observed execution metrics.
//!
//! ## Overview
//!
//! The controller is deliberately conservative: it moves the concurrency
//! level by at most one step per evaluation, bounded by configured min/max.
//! With too few samples to judge (fewer than five) it stays optimistic and
//! returns the configured maximum. Healthy recent history (fast durations,
//! high success rate) nudges the level up; slow or failing history nudges it
//! down. Everything in between holds steady.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::workflow::definition::{Intensity, StepDefinition};

/// Tuning knobs for the adaptive loop.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub max_concurrency: usize,
    pub min_concurrency: usize,
    /// Rolling metrics window capacity.
    pub window_capacity: usize,
    /// How many of the most recent samples drive each adjustment.
    pub recent_sample_count: usize,
    /// Below this many samples the controller stays at max.
    pub min_samples: usize,
    pub fast_threshold: Duration,
    pub slow_threshold: Duration,
    pub high_success_rate: f64,
    pub low_success_rate: f64,
    /// Estimate returned when no metrics exist at all.
    pub default_estimate: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            min_concurrency: 1,
            window_capacity: 100,
            recent_sample_count: 20,
            min_samples: 5,
            fast_threshold: Duration::from_secs(5),
            slow_threshold: Duration::from_secs(30),
            high_success_rate: 0.9,
            low_success_rate: 0.7,
            default_estimate: Duration::from_secs(30),
        }
    }
}

/// One observed step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step_name: String,
    pub duration: Duration,
    pub success: bool,
}

/// Resource appetite buckets for grouping compatible steps into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceBucket {
    Cpu,
    Memory,
    Io,
    Balanced,
}

struct ControllerState {
    window: VecDeque<StepMetrics>,
    current: usize,
}

/// Rolling-window concurrency controller. Shared across the runner and
/// scheduler via `Arc`.
pub struct ConcurrencyController {
    config: ConcurrencyConfig,
    state: Mutex<ControllerState>,
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let current = config.max_concurrency.max(config.min_concurrency);
        Self {
            config,
            state: Mutex::new(ControllerState {
                window: VecDeque::new(),
                current,
            }),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Record one execution sample, evicting the oldest beyond capacity.
    pub fn record_metrics(&self, metrics: StepMetrics) {
        let mut state = self.state.lock();
        state.window.push_back(metrics);
        while state.window.len() > self.config.window_capacity {
            state.window.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().window.len()
    }

    /// The level the last evaluation settled on.
    pub fn current_concurrency(&self) -> usize {
        self.state.lock().current
    }

    /// Re-evaluate and return the concurrency level.
    ///
    /// Fewer than `min_samples` observations return the configured maximum.
    /// Otherwise the most recent samples decide: fast and reliable moves the
    /// level up one, slow or unreliable moves it down one, anything else
    /// holds.
    pub fn calculate_optimal_concurrency(&self) -> usize {
        let mut state = self.state.lock();

        if state.window.len() < self.config.min_samples {
            state.current = self.config.max_concurrency;
            return state.current;
        }

        let recent: Vec<&StepMetrics> = state
            .window
            .iter()
            .rev()
            .take(self.config.recent_sample_count)
            .collect();

        let total_secs: f64 = recent.iter().map(|m| m.duration.as_secs_f64()).sum();
        let avg_duration = total_secs / recent.len() as f64;
        let successes = recent.iter().filter(|m| m.success).count();
        let success_rate = successes as f64 / recent.len() as f64;

        let previous = state.current;
        if avg_duration < self.config.fast_threshold.as_secs_f64()
            && success_rate > self.config.high_success_rate
        {
            state.current = (state.current + 1).min(self.config.max_concurrency);
        } else if avg_duration > self.config.slow_threshold.as_secs_f64()
            || success_rate < self.config.low_success_rate
        {
            state.current = state
                .current
                .saturating_sub(1)
                .max(self.config.min_concurrency);
        }

        if state.current != previous {
            debug!(
                previous = previous,
                current = state.current,
                avg_duration_secs = avg_duration,
                success_rate = success_rate,
                "🎛️ CONCURRENCY: adjusted parallelism"
            );
        }

        state.current
    }

    /// Expected duration for a step: that step's observed mean, else the
    /// overall mean, else the configured default.
    pub fn estimate_duration(&self, step_name: &str) -> Duration {
        let state = self.state.lock();

        let step_samples: Vec<f64> = state
            .window
            .iter()
            .filter(|m| m.step_name == step_name)
            .map(|m| m.duration.as_secs_f64())
            .collect();
        if !step_samples.is_empty() {
            let mean = step_samples.iter().sum::<f64>() / step_samples.len() as f64;
            return Duration::from_secs_f64(mean);
        }

        if !state.window.is_empty() {
            let mean = state
                .window
                .iter()
                .map(|m| m.duration.as_secs_f64())
                .sum::<f64>()
                / state.window.len() as f64;
            return Duration::from_secs_f64(mean);
        }

        self.config.default_estimate
    }

    /// How many tasks to launch next: twice the current level so the pipeline
    /// stays fed, but never more than remain.
    pub fn optimal_batch_size(&self, remaining: usize) -> usize {
        if remaining == 0 {
            return 0;
        }
        let current = self.state.lock().current;
        (current * 2).clamp(1, remaining)
    }

    /// Bucket steps by declared resource intensity so batches mix compatible
    /// appetites. Highest-priority declared High wins: cpu, then memory, then
    /// io; everything else lands in Balanced.
    pub fn group_by_resource_requirements<'a>(
        &self,
        steps: &'a [StepDefinition],
    ) -> HashMap<ResourceBucket, Vec<&'a StepDefinition>> {
        let mut groups: HashMap<ResourceBucket, Vec<&StepDefinition>> = HashMap::new();
        for step in steps {
            let bucket = match &step.resources {
                Some(profile) => {
                    if profile.cpu == Intensity::High {
                        ResourceBucket::Cpu
                    } else if profile.memory == Intensity::High {
                        ResourceBucket::Memory
                    } else if profile.io == Intensity::High {
                        ResourceBucket::Io
                    } else {
                        ResourceBucket::Balanced
                    }
                }
                None => ResourceBucket::Balanced,
            };
            groups.entry(bucket).or_default().push(step);
        }
        groups
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}
