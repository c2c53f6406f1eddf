//! Shared helpers for integration tests: workflow builders, a scripted
//! invoker double, and a recording assignment handler.

#![allow(dead_code)] // Not every suite uses every helper.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ensemble_core::agent::{AgentInvoker, AgentResult, TaskSpec};
use ensemble_core::scheduler::state::AgentAssignment;
use ensemble_core::scheduler::AssignmentHandler;
use ensemble_core::workflow::{AgentDefinition, StepDefinition, WorkflowDefinition};

/// The three-stage pipeline used throughout: fetch -> build -> test.
pub fn pipeline_workflow(name: &str) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        description: Some("fetch, build, then test".to_string()),
        agents: vec![AgentDefinition::new("builder")],
        steps: vec![
            StepDefinition::new("fetch"),
            StepDefinition {
                depends_on: vec!["fetch".to_string()],
                ..StepDefinition::new("build")
            },
            StepDefinition {
                depends_on: vec!["build".to_string()],
                ..StepDefinition::new("test")
            },
        ],
    }
}

/// A task spec for a pipeline step.
pub fn task_for(workflow: &str, step: &str) -> TaskSpec {
    TaskSpec::new(workflow, step, "builder", format!("run the {step} step"))
}

/// Records every batch of assignments the scheduler emits.
#[derive(Default)]
pub struct RecordingHandler {
    batches: Mutex<Vec<(u64, Vec<AgentAssignment>)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<(u64, Vec<AgentAssignment>)> {
        self.batches.lock().clone()
    }

    /// Step names assigned across all recorded sprints, in emission order.
    pub fn assigned_steps(&self) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, batch)| batch.iter().map(|a| a.step_name.clone()))
            .collect()
    }
}

#[async_trait]
impl AssignmentHandler for RecordingHandler {
    async fn on_assignments(
        &self,
        _workflow: &str,
        sprint_number: u64,
        assignments: &[AgentAssignment],
    ) -> anyhow::Result<()> {
        self.batches.lock().push((sprint_number, assignments.to_vec()));
        Ok(())
    }
}

/// An invoker that replays a script of outcomes per step name; the last
/// outcome for a step repeats once the script is exhausted.
pub struct ScriptedInvoker {
    scripts: Mutex<Vec<(String, Vec<anyhow::Result<AgentResult>>)>>,
    calls: AtomicU32,
    terminated: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            terminated: Mutex::new(Vec::new()),
        }
    }

    /// Every step succeeds with a summary naming the step.
    pub fn all_succeed() -> Self {
        Self::new()
    }

    pub fn script_step(self, step: &str, outcomes: Vec<anyhow::Result<AgentResult>>) -> Self {
        self.scripts.lock().push((step.to_string(), outcomes));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn terminated_workflows(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, task: &TaskSpec, _prompt: &str) -> anyhow::Result<AgentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut scripts = self.scripts.lock();
        if let Some((_, outcomes)) = scripts
            .iter_mut()
            .find(|(step, _)| step == &task.step_name)
        {
            let outcome = if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                match &outcomes[0] {
                    Ok(result) => Ok(result.clone()),
                    Err(error) => Err(anyhow::anyhow!(error.to_string())),
                }
            };
            return outcome;
        }

        Ok(AgentResult::ok(format!("{} done", task.step_name)))
    }

    async fn terminate_workflow(&self, workflow: &str, _grace: Duration) -> anyhow::Result<()> {
        self.terminated.lock().push(workflow.to_string());
        Ok(())
    }
}
