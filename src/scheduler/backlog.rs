//! # Priority Backlog
//!
//! Backlog construction and ordering. Steps with tasks expand into one item
//! per task; bare steps become single items. Lower priority values are more
//! urgent, and the backlog is kept sorted ascending so sprint assignment
//! walks it front to back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::definition::WorkflowDefinition;

/// One schedulable unit of work in the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogItem {
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lower is more urgent.
    pub priority: i64,
    /// Step names that must complete before this item can run.
    pub dependencies: Vec<String>,
    pub estimated_effort: u32,
    pub added_at: DateTime<Utc>,
}

impl BacklogItem {
    /// Identity within a backlog: step name plus (for task items) task name.
    pub fn matches(&self, step_name: &str, task_name: Option<&str>) -> bool {
        self.step_name == step_name && self.task_name.as_deref() == task_name
    }
}

/// Expand a workflow into its initial backlog, sorted by ascending priority.
///
/// Priority defaults are positional: a bare step at index `i` gets
/// `(i + 1) * 10`, leaving room to slot work in between; a task at index `j`
/// within a step gets the step's priority plus `j + 1` so tasks keep their
/// authoring order right behind the step slot.
pub fn build_backlog(workflow: &WorkflowDefinition) -> Vec<BacklogItem> {
    let now = Utc::now();
    let mut items = Vec::new();

    for (step_index, step) in workflow.steps.iter().enumerate() {
        let step_priority = step
            .priority
            .unwrap_or((step_index as i64 + 1) * 10);

        if step.tasks.is_empty() {
            items.push(BacklogItem {
                step_name: step.name.clone(),
                task_name: None,
                description: step.description.clone(),
                priority: step_priority,
                dependencies: step.depends_on.clone(),
                estimated_effort: step.effort.unwrap_or(1),
                added_at: now,
            });
        } else {
            for (task_index, task) in step.tasks.iter().enumerate() {
                items.push(BacklogItem {
                    step_name: step.name.clone(),
                    task_name: Some(task.name.clone()),
                    description: task.description.clone(),
                    priority: task
                        .priority
                        .unwrap_or(step_priority + task_index as i64 + 1),
                    dependencies: step.depends_on.clone(),
                    estimated_effort: task.effort.unwrap_or(1),
                    added_at: now,
                });
            }
        }
    }

    sort_backlog(&mut items);
    items
}

/// Ascending by priority. Stable, so equal priorities keep insertion order.
pub fn sort_backlog(items: &mut [BacklogItem]) {
    items.sort_by_key(|item| item.priority);
}
