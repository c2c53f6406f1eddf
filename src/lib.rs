//! # Ensemble Core
//!
//! Single-process orchestration engine for dependency-driven AI-agent
//! workflows.
//!
//! ## Overview
//!
//! A workflow is a set of named steps with dependencies, each delegated to an
//! external agent process. Invoking the agent is the easy part; this crate
//! owns the coordination around it:
//!
//! - [`workflow`] - typed workflow schema plus pure dependency-graph
//!   validation, readiness, and cycle detection
//! - [`scheduler`] - the sprint loop: per-workflow backlogs, priority-ordered
//!   assignment of ready work to agents, status feedback
//! - [`retry`] - error classification and exponential backoff with jitter
//! - [`cache`] - content-addressed memoization of successful results across a
//!   bounded memory tier and a JSON-file disk tier
//! - [`checkpoint`] - resumable progress snapshots over pluggable storage
//!   backends with autosave
//! - [`concurrency`] - adaptive parallelism from a rolling window of observed
//!   execution metrics
//! - [`agent`] / [`runner`] - the transport seam and the cache-gated,
//!   retry-wrapped, cancellable execution glue
//!
//! ## Architecture
//!
//! The scheduler asks the dependency graph which steps are ready, converts
//! readiness into prioritized assignments, and hands each sprint's batch to
//! an [`scheduler::AssignmentHandler`]. The surrounding executor runs each
//! assignment through the [`runner::TaskRunner`], which consults the cache,
//! wraps the [`agent::AgentInvoker`] in the retry policy, and feeds metrics
//! to the concurrency controller. Checkpoints snapshot progress so a crashed
//! or stopped run resumes where it left off.
//!
//! Everything is single-process: periodic work (sprints, cache cleanup,
//! checkpoint autosave) runs as independently cancellable tokio tasks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ensemble_core::scheduler::{AssignmentHandler, SprintScheduler};
//! use ensemble_core::scheduler::state::AgentAssignment;
//! use ensemble_core::workflow::WorkflowDefinition;
//!
//! struct Executor;
//!
//! #[async_trait::async_trait]
//! impl AssignmentHandler for Executor {
//!     async fn on_assignments(
//!         &self,
//!         workflow: &str,
//!         sprint: u64,
//!         assignments: &[AgentAssignment],
//!     ) -> anyhow::Result<()> {
//!         println!("{workflow} sprint {sprint}: {} assignment(s)", assignments.len());
//!         Ok(())
//!     }
//! }
//!
//! async fn run(yaml: &str) -> ensemble_core::Result<()> {
//!     ensemble_core::logging::init_structured_logging();
//!     let workflow = WorkflowDefinition::from_yaml_str(yaml)?;
//!     let scheduler = SprintScheduler::default();
//!     scheduler.start_monitoring(workflow, Arc::new(Executor))?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cache;
pub mod checkpoint;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod workflow;

pub use agent::{AgentInvoker, AgentResult, TaskSpec};
pub use cache::{CacheStats, ResultCache};
pub use checkpoint::{CheckpointManager, WorkflowCheckpoint};
pub use concurrency::{ConcurrencyController, StepMetrics};
pub use config::{ConfigLoader, EnsembleConfig};
pub use error::{EnsembleError, Result};
pub use retry::{classify_error, ErrorKind, RetryEngine, RetryPolicy};
pub use runner::{TaskExecution, TaskRunner};
pub use scheduler::{AssignmentHandler, SprintScheduler};
pub use workflow::{StepDefinition, WorkflowDefinition};
