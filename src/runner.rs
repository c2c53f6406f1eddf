//! # Task Runner
//!
//! The execution glue between scheduling and the agent transport: consult
//! the result cache, on a miss run the invoker under the retry policy, write
//! successes back to the cache, and feed metrics to the concurrency
//! controller.
//!
//! ## Overview
//!
//! [`TaskRunner`] owns no scheduling decisions. The executor hands it one
//! task at a time (typically one per assignment from a sprint); many
//! executions may be in flight concurrently and each carries its own retry
//! sequence. A returned `AgentResult { success: false }` is treated exactly
//! like a thrown error: its message is classified and, when retryable, the
//! invocation is re-run under backoff.
//!
//! Cancellation is per workflow: [`TaskRunner::cancel_workflow`] flips a
//! watch signal every in-flight execution for that workflow is selecting on,
//! then asks the invoker to terminate its subprocesses with the configured
//! grace period. Cancelled executions resolve to a failed result, never a
//! hang.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{AgentInvoker, AgentResult, TaskSpec};
use crate::cache::ResultCache;
use crate::concurrency::{ConcurrencyController, StepMetrics};
use crate::retry::RetryEngine;

/// Runner tuning.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Delay between the graceful termination signal and the transport's
    /// forced kill.
    pub agent_grace_period: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            agent_grace_period: Duration::from_secs(5),
        }
    }
}

/// How one task execution concluded.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub result: AgentResult,
    /// True when the result was served from the cache without invoking the
    /// transport.
    pub from_cache: bool,
    /// Invocation attempts made; zero on a cache hit.
    pub attempts: u32,
    pub duration: Duration,
}

/// Cache-gated, retry-wrapped, cancellable task execution.
pub struct TaskRunner {
    invoker: Arc<dyn AgentInvoker>,
    cache: Arc<ResultCache>,
    retry: RetryEngine,
    concurrency: Arc<ConcurrencyController>,
    config: RunnerConfig,
    cancellations: DashMap<String, watch::Sender<bool>>,
}

impl TaskRunner {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        cache: Arc<ResultCache>,
        retry: RetryEngine,
        concurrency: Arc<ConcurrencyController>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            invoker,
            cache,
            retry,
            concurrency,
            config,
            cancellations: DashMap::new(),
        }
    }

    /// Execute one task: cache first, then the invoker under retry.
    ///
    /// Only successful results are written back to the cache. Metrics are
    /// recorded for real invocations only; cache hits would skew the
    /// duration window toward zero.
    pub async fn execute(&self, task: &TaskSpec, prompt: &str) -> TaskExecution {
        if let Some(result) = self.cache.get(task, prompt).await {
            debug!(
                workflow = %task.workflow_name,
                step = %task.step_name,
                "🏃 TASK RUNNER: cache hit, skipping invocation"
            );
            return TaskExecution {
                result,
                from_cache: true,
                attempts: 0,
                duration: Duration::ZERO,
            };
        }

        let mut cancelled = self.cancel_receiver(&task.workflow_name);
        let started = Instant::now();

        let operation = format!("{}/{}", task.workflow_name, task.step_name);
        let retried = self.retry.retry(&operation, || {
            let invoker = Arc::clone(&self.invoker);
            async move {
                match invoker.invoke(task, prompt).await {
                    // A failed result is a classifiable failure like any
                    // thrown error.
                    Ok(result) if !result.success => Err(failure_message(&result)),
                    Ok(result) => Ok(result),
                    Err(error) => Err(error.to_string()),
                }
            }
        });

        let outcome = tokio::select! {
            outcome = retried => outcome,
            _ = wait_for_cancel(&mut cancelled) => {
                info!(
                    workflow = %task.workflow_name,
                    step = %task.step_name,
                    "🏃 TASK RUNNER: execution cancelled"
                );
                return TaskExecution {
                    result: AgentResult::failed(
                        format!("step '{}' cancelled", task.step_name),
                        "workflow cancelled",
                    ),
                    from_cache: false,
                    attempts: 0,
                    duration: started.elapsed(),
                };
            }
        };

        let duration = started.elapsed();
        let attempts = outcome.attempts;
        let result = match outcome.into_result() {
            Ok(result) => {
                self.cache.set(task, prompt, &result, None).await;
                result
            }
            Err(retry_error) => {
                warn!(
                    workflow = %task.workflow_name,
                    step = %task.step_name,
                    attempts,
                    error_kind = %retry_error.kind,
                    "🏃 TASK RUNNER: execution failed"
                );
                AgentResult::failed(
                    format!("step '{}' failed after {attempts} attempt(s)", task.step_name),
                    retry_error.message,
                )
            }
        };

        self.concurrency.record_metrics(StepMetrics {
            step_name: task.step_name.clone(),
            duration,
            success: result.success,
        });

        TaskExecution {
            result,
            from_cache: false,
            attempts,
            duration,
        }
    }

    /// Signal every in-flight execution for a workflow to stop, then ask the
    /// transport to terminate its subprocesses. Best effort on both counts.
    pub async fn cancel_workflow(&self, workflow: &str) {
        if let Some((_, sender)) = self.cancellations.remove(workflow) {
            let _ = sender.send(true);
        }
        info!(workflow = %workflow, "🏃 TASK RUNNER: cancelling workflow executions");
        if let Err(error) = self
            .invoker
            .terminate_workflow(workflow, self.config.agent_grace_period)
            .await
        {
            warn!(
                workflow = %workflow,
                %error,
                "🏃 TASK RUNNER: transport termination failed"
            );
        }
    }

    fn cancel_receiver(&self, workflow: &str) -> watch::Receiver<bool> {
        self.cancellations
            .entry(workflow.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }
}

fn failure_message(result: &AgentResult) -> String {
    result
        .error
        .clone()
        .unwrap_or_else(|| result.summary.clone())
}

async fn wait_for_cancel(receiver: &mut watch::Receiver<bool>) {
    // Already-cancelled workflows short-circuit before the first await.
    if *receiver.borrow() {
        return;
    }
    while receiver.changed().await.is_ok() {
        if *receiver.borrow() {
            return;
        }
    }
    // Sender dropped without cancelling; park forever so the select resolves
    // through the execution branch.
    std::future::pending::<()>().await;
}
