//! # Per-Workflow Run State
//!
//! Everything the scheduler tracks for one monitored workflow: step and task
//! statuses, the ordered backlog, derived resume identifiers, and the
//! append-only sprint history. The registry owns exactly one
//! [`WorkflowRunState`] per workflow, behind a lock; these types carry no
//! synchronization of their own.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::backlog::{build_backlog, BacklogItem};
use crate::scheduler::resume::derive_resume_id;
use crate::workflow::definition::{ExecutionStatus, StepDefinition, WorkflowDefinition};

/// Lifecycle of an emitted assignment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One unit of work handed to an agent during a sprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub agent_name: String,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Deterministic session identity; see [`crate::scheduler::resume`].
    pub resume_id: String,
    pub assigned_at: DateTime<Utc>,
    pub status: AssignmentStatus,
    pub priority: i64,
}

/// One scheduling round. Appended to history whether or not it produced
/// assignments, so gaps in activity stay visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    pub sprint_number: u64,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub assignments: Vec<AgentAssignment>,
    pub completed: bool,
}

/// Mutable scheduling state for one monitored workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunState {
    pub workflow_name: String,
    pub step_status: HashMap<String, ExecutionStatus>,
    /// Keyed `"{step}.{task}"`.
    pub task_status: HashMap<String, ExecutionStatus>,
    /// Agent name to resume identifier.
    pub agent_resume_ids: HashMap<String, String>,
    /// Sorted ascending by priority.
    pub backlog: Vec<BacklogItem>,
    pub sprints: Vec<Sprint>,
    pub current_sprint: u64,
}

impl WorkflowRunState {
    /// Build the initial state for a freshly monitored workflow: everything
    /// pending, backlog expanded and sorted, resume ids pre-derived for the
    /// declared roster.
    pub fn initialize(workflow: &WorkflowDefinition) -> Self {
        let mut step_status = HashMap::new();
        let mut task_status = HashMap::new();
        for step in &workflow.steps {
            step_status.insert(step.name.clone(), ExecutionStatus::Pending);
            for task in &step.tasks {
                task_status.insert(
                    task_key(&step.name, &task.name),
                    ExecutionStatus::Pending,
                );
            }
        }

        let agent_resume_ids = workflow
            .agents
            .iter()
            .map(|agent| {
                (
                    agent.name.clone(),
                    derive_resume_id(&workflow.name, &agent.name),
                )
            })
            .collect();

        Self {
            workflow_name: workflow.name.clone(),
            step_status,
            task_status,
            agent_resume_ids,
            backlog: build_backlog(workflow),
            sprints: Vec::new(),
            current_sprint: 0,
        }
    }

    /// Fetch or derive the resume id for an agent.
    pub fn resume_id(&mut self, agent: &str) -> String {
        if let Some(id) = self.agent_resume_ids.get(agent) {
            return id.clone();
        }
        let id = derive_resume_id(&self.workflow_name, agent);
        self.agent_resume_ids
            .insert(agent.to_string(), id.clone());
        id
    }

    /// Whether every named dependency's step has completed.
    pub fn dependencies_met(&self, dependencies: &[String]) -> bool {
        dependencies
            .iter()
            .all(|dep| self.step_status.get(dep) == Some(&ExecutionStatus::Completed))
    }

    /// An item is schedulable while its own status (task status for task
    /// items, step status otherwise) is still pending or unrecorded.
    pub fn is_item_pending(&self, item: &BacklogItem) -> bool {
        let status = match &item.task_name {
            Some(task) => self.task_status.get(&task_key(&item.step_name, task)),
            None => self.step_status.get(&item.step_name),
        };
        matches!(status, None | Some(ExecutionStatus::Pending))
    }

    /// Whether every task of a step has completed. Steps without tasks are
    /// trivially complete on this axis.
    pub fn tasks_complete(&self, step: &StepDefinition) -> bool {
        step.tasks.iter().all(|task| {
            self.task_status.get(&task_key(&step.name, &task.name))
                == Some(&ExecutionStatus::Completed)
        })
    }
}

/// Composite key for task statuses.
pub fn task_key(step: &str, task: &str) -> String {
    format!("{step}.{task}")
}
