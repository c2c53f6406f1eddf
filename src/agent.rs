//! # Agent Invocation Interface
//!
//! The boundary between the engine and whatever transport actually runs
//! agents (subprocesses, an HTTP sidecar, a test double). The engine only
//! ever talks to [`AgentInvoker`]; everything on the other side of that trait
//! is out of scope here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The unit of work handed to an invoker. The cache key is derived from
/// `step_name`, `role`, `description` and the prompt, so two specs that agree
/// on those fields are interchangeable from the cache's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    pub role: String,
    pub description: String,
}

impl TaskSpec {
    pub fn new(
        workflow_name: impl Into<String>,
        step_name: impl Into<String>,
        role: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            step_name: step_name.into(),
            role: role.into(),
            description: description.into(),
        }
    }
}

/// What came back from an agent. Only successful results are cacheable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResult {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            output: None,
            error: None,
        }
    }

    pub fn failed(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Transport-side execution of agent work.
///
/// `invoke` errors are stringified and classified by the retry engine, so
/// implementations should put the salient failure detail in the error
/// message. `terminate_workflow` is best-effort cleanup for cancellation;
/// transports without subprocess state can keep the default no-op.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, task: &TaskSpec, prompt: &str) -> anyhow::Result<AgentResult>;

    async fn terminate_workflow(&self, _workflow: &str, _grace: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}
