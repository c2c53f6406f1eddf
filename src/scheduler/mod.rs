//! # Sprint Scheduler
//!
//! Continuous, priority-driven assignment of workflow steps to agents.
//!
//! ## Overview
//!
//! Each monitored workflow gets its own run state (backlog, statuses, sprint
//! history) in a registry owned by the scheduler, plus an independent sprint
//! loop on a tokio interval (default 30s, first tick immediate). Every sprint
//! walks the backlog in priority order, picks the items whose dependencies
//! have completed, marks them running, and hands the batch to the registered
//! [`AssignmentHandler`]. Handler errors are logged and never stop the loop.
//!
//! Status feedback flows back in through [`SprintScheduler::update_step_status`]
//! and [`SprintScheduler::update_task_status`]; both overwrite plainly, with
//! no cascading aggregation. Callers that want "step done when all tasks
//! done" aggregate explicitly via [`SprintScheduler::tasks_complete`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ensemble_core::scheduler::{AssignmentHandler, SprintScheduler};
//! use ensemble_core::scheduler::state::AgentAssignment;
//! use ensemble_core::workflow::WorkflowDefinition;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl AssignmentHandler for Printer {
//!     async fn on_assignments(
//!         &self,
//!         workflow: &str,
//!         sprint: u64,
//!         assignments: &[AgentAssignment],
//!     ) -> anyhow::Result<()> {
//!         for a in assignments {
//!             println!("{workflow} sprint {sprint}: {} -> {}", a.step_name, a.agent_name);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! async fn demo(workflow: WorkflowDefinition) -> ensemble_core::Result<()> {
//!     let scheduler = SprintScheduler::default();
//!     scheduler.start_monitoring(workflow, Arc::new(Printer))?;
//!     Ok(())
//! }
//! ```

pub mod backlog;
pub mod resume;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{EnsembleError, Result};
use crate::workflow::definition::{ExecutionStatus, WorkflowDefinition};
use crate::workflow::graph;
use backlog::{sort_backlog, BacklogItem};
use state::{task_key, AgentAssignment, AssignmentStatus, Sprint, WorkflowRunState};

pub use backlog::build_backlog;
pub use resume::derive_resume_id;

/// Scheduler-wide settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sprint_interval: Duration,
    /// Assignee of last resort when neither the step nor the roster names an
    /// agent.
    pub default_agent: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sprint_interval: Duration::from_secs(30),
            default_agent: "default".to_string(),
        }
    }
}

/// Receives each sprint's freshly produced assignments. Called outside the
/// scheduler's locks; may take as long as it likes without stalling state
/// queries.
#[async_trait]
pub trait AssignmentHandler: Send + Sync {
    async fn on_assignments(
        &self,
        workflow: &str,
        sprint_number: u64,
        assignments: &[AgentAssignment],
    ) -> anyhow::Result<()>;
}

struct WorkflowEntry {
    definition: WorkflowDefinition,
    state: Mutex<WorkflowRunState>,
}

struct MonitorHandle {
    shutdown: watch::Sender<bool>,
}

/// Registry of monitored workflows plus their sprint loops.
pub struct SprintScheduler {
    config: SchedulerConfig,
    workflows: DashMap<String, Arc<WorkflowEntry>>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
}

impl SprintScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            workflows: DashMap::new(),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a workflow, register its run state, and spawn its sprint
    /// loop at the configured interval.
    ///
    /// Structural validation failures are returned as one batch; the
    /// workflow is not registered. Lint findings are logged and do not
    /// block.
    pub fn start_monitoring(
        &self,
        workflow: WorkflowDefinition,
        handler: Arc<dyn AssignmentHandler>,
    ) -> Result<()> {
        self.start_monitoring_with_interval(workflow, handler, self.config.sprint_interval)
    }

    /// [`SprintScheduler::start_monitoring`] with a per-workflow sprint
    /// interval.
    pub fn start_monitoring_with_interval(
        &self,
        workflow: WorkflowDefinition,
        handler: Arc<dyn AssignmentHandler>,
        interval: Duration,
    ) -> Result<()> {
        let name = workflow.name.clone();

        let errors = graph::validate(&workflow.steps);
        if !errors.is_empty() {
            return Err(EnsembleError::Validation { errors });
        }
        for warning in graph::lint(&workflow) {
            warn!(workflow = %name, %warning, "🎯 SPRINT SCHEDULER: workflow lint finding");
        }

        let run_state = WorkflowRunState::initialize(&workflow);
        let backlog_size = run_state.backlog.len();
        let entry = Arc::new(WorkflowEntry {
            definition: workflow,
            state: Mutex::new(run_state),
        });

        match self.workflows.entry(name.clone()) {
            Entry::Occupied(_) => return Err(EnsembleError::AlreadyMonitored(name)),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
            }
        }

        let (tx, rx) = watch::channel(false);
        tokio::spawn(sprint_loop(
            name.clone(),
            entry,
            handler,
            interval,
            self.config.default_agent.clone(),
            rx,
        ));
        self.monitors
            .lock()
            .insert(name.clone(), MonitorHandle { shutdown: tx });

        info!(
            workflow = %name,
            backlog_items = backlog_size,
            interval_secs = interval.as_secs(),
            "🎯 SPRINT SCHEDULER: monitoring started"
        );
        Ok(())
    }

    /// Stop the sprint loop and discard all run state for a workflow.
    /// Durable progress belongs to the checkpoint store, not here.
    pub fn stop_monitoring(&self, workflow: &str) -> bool {
        let removed = self.workflows.remove(workflow).is_some();
        if let Some(handle) = self.monitors.lock().remove(workflow) {
            let _ = handle.shutdown.send(true);
        }
        if removed {
            info!(workflow = %workflow, "🎯 SPRINT SCHEDULER: monitoring stopped, state discarded");
        }
        removed
    }

    pub fn is_monitoring(&self, workflow: &str) -> bool {
        self.workflows.contains_key(workflow)
    }

    pub fn monitored_workflows(&self) -> Vec<String> {
        self.workflows.iter().map(|e| e.key().clone()).collect()
    }

    /// Overwrite a step's status. No cascading: completing a step does not
    /// touch its tasks, and vice versa.
    pub fn update_step_status(&self, workflow: &str, step: &str, status: ExecutionStatus) {
        let updated = self.with_state(workflow, |state| {
            state.step_status.insert(step.to_string(), status);
        });
        if updated.is_some() {
            debug!(
                workflow = %workflow,
                step = %step,
                status = %status,
                "🎯 SPRINT SCHEDULER: step status updated"
            );
        } else {
            debug!(
                workflow = %workflow,
                step = %step,
                "🎯 SPRINT SCHEDULER: status update ignored, workflow not monitored"
            );
        }
    }

    /// Overwrite a task's status, keyed `"{step}.{task}"`.
    pub fn update_task_status(
        &self,
        workflow: &str,
        step: &str,
        task: &str,
        status: ExecutionStatus,
    ) {
        let updated = self.with_state(workflow, |state| {
            state.task_status.insert(task_key(step, task), status);
        });
        if updated.is_some() {
            debug!(
                workflow = %workflow,
                step = %step,
                task = %task,
                status = %status,
                "🎯 SPRINT SCHEDULER: task status updated"
            );
        }
    }

    /// Whether every task of a step has completed, for callers aggregating
    /// task completion into step completion explicitly. `None` when the
    /// workflow or step is unknown.
    pub fn tasks_complete(&self, workflow: &str, step_name: &str) -> Option<bool> {
        let entry = self.workflows.get(workflow)?;
        let step = entry.definition.step(step_name)?;
        let state = entry.state.lock();
        Some(state.tasks_complete(step))
    }

    /// Insert a new backlog item, keeping the backlog sorted. Duplicates
    /// (same step + task identity) are rejected.
    pub fn add_to_backlog(&self, workflow: &str, item: BacklogItem) -> bool {
        self.with_state(workflow, |state| {
            let duplicate = state
                .backlog
                .iter()
                .any(|existing| existing.matches(&item.step_name, item.task_name.as_deref()));
            if duplicate {
                return false;
            }
            state.backlog.push(item);
            sort_backlog(&mut state.backlog);
            true
        })
        .unwrap_or(false)
    }

    /// Pull an item from the backlog. Returns whether anything was removed.
    pub fn remove_from_backlog(
        &self,
        workflow: &str,
        step_name: &str,
        task_name: Option<&str>,
    ) -> bool {
        self.with_state(workflow, |state| {
            let position = state
                .backlog
                .iter()
                .position(|item| item.matches(step_name, task_name));
            match position {
                Some(index) => {
                    state.backlog.remove(index);
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
    }

    /// Re-prioritize an item in place and re-sort the backlog.
    pub fn update_backlog_priority(
        &self,
        workflow: &str,
        step_name: &str,
        task_name: Option<&str>,
        priority: i64,
    ) -> bool {
        self.with_state(workflow, |state| {
            let found = state
                .backlog
                .iter_mut()
                .find(|item| item.matches(step_name, task_name));
            match found {
                Some(item) => {
                    item.priority = priority;
                    sort_backlog(&mut state.backlog);
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
    }

    pub fn get_backlog(&self, workflow: &str) -> Option<Vec<BacklogItem>> {
        self.with_state(workflow, |state| state.backlog.clone())
    }

    /// Point-in-time snapshot of the full run state.
    pub fn get_workflow_state(&self, workflow: &str) -> Option<WorkflowRunState> {
        self.with_state(workflow, |state| state.clone())
    }

    pub fn get_resume_ids(&self, workflow: &str) -> Option<HashMap<String, String>> {
        self.with_state(workflow, |state| state.agent_resume_ids.clone())
    }

    fn with_state<T>(
        &self,
        workflow: &str,
        f: impl FnOnce(&mut WorkflowRunState) -> T,
    ) -> Option<T> {
        let entry = self.workflows.get(workflow)?;
        let mut state = entry.state.lock();
        Some(f(&mut state))
    }
}

impl Default for SprintScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

async fn sprint_loop(
    workflow: String,
    entry: Arc<WorkflowEntry>,
    handler: Arc<dyn AssignmentHandler>,
    period: Duration,
    default_agent: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_sprint(&workflow, &entry, handler.as_ref(), &default_agent).await;
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(workflow = %workflow, "🎯 SPRINT SCHEDULER: sprint loop exited");
}

/// One scheduling round. Assignment selection and status mutation happen
/// under the state lock; the handler runs after the lock is released.
async fn run_sprint(
    workflow: &str,
    entry: &WorkflowEntry,
    handler: &dyn AssignmentHandler,
    default_agent: &str,
) {
    let (sprint_number, assignments) = {
        let mut state = entry.state.lock();
        state.current_sprint += 1;
        let sprint_number = state.current_sprint;

        let candidates: Vec<BacklogItem> = state
            .backlog
            .iter()
            .filter(|item| state.is_item_pending(item) && state.dependencies_met(&item.dependencies))
            .cloned()
            .collect();

        let mut assignments = Vec::new();
        for item in candidates {
            // The item may be orphaned by backlog edits; skip silently.
            let Some(step) = entry.definition.step(&item.step_name) else {
                continue;
            };
            // Step-level readiness re-check, covering dependencies edited on
            // the step since the item was built.
            if !state.dependencies_met(&step.depends_on) {
                continue;
            }

            let agent = step
                .agent
                .clone()
                .or_else(|| entry.definition.default_agent().map(String::from))
                .unwrap_or_else(|| default_agent.to_string());
            let resume_id = state.resume_id(&agent);

            let assignment = AgentAssignment {
                agent_name: agent,
                step_name: item.step_name.clone(),
                task_name: item.task_name.clone(),
                resume_id,
                assigned_at: Utc::now(),
                status: AssignmentStatus::Pending,
                priority: item.priority,
            };

            if let Some(task) = &item.task_name {
                state
                    .task_status
                    .insert(task_key(&item.step_name, task), ExecutionStatus::Running);
            }
            state
                .step_status
                .insert(item.step_name.clone(), ExecutionStatus::Running);

            debug!(
                workflow = %workflow,
                sprint = sprint_number,
                step = %assignment.step_name,
                task = ?assignment.task_name,
                agent = %assignment.agent_name,
                "🎯 SPRINT SCHEDULER: assigned"
            );
            assignments.push(assignment);
        }

        state.sprints.push(Sprint {
            sprint_number,
            start_time: Utc::now(),
            end_time: None,
            assignments: assignments.clone(),
            completed: false,
        });

        (sprint_number, assignments)
    };

    if !assignments.is_empty() {
        info!(
            workflow = %workflow,
            sprint = sprint_number,
            count = assignments.len(),
            "🎯 SPRINT SCHEDULER: sprint produced assignments"
        );
        if let Err(handler_error) =
            handler.on_assignments(workflow, sprint_number, &assignments).await
        {
            error!(
                workflow = %workflow,
                sprint = sprint_number,
                error = %handler_error,
                "🎯 SPRINT SCHEDULER: assignment handler failed, continuing"
            );
        }
    }

    let mut state = entry.state.lock();
    if let Some(sprint) = state
        .sprints
        .iter_mut()
        .find(|s| s.sprint_number == sprint_number)
    {
        sprint.end_time = Some(Utc::now());
        sprint.completed = true;
    }
}
