//! # Workflow Schema and Dependency Resolution
//!
//! The typed workflow document model plus the pure dependency-graph functions
//! the scheduler builds on.

pub mod definition;
pub mod graph;

pub use definition::{
    AgentDefinition, ExecutionStatus, Intensity, ResourceProfile, StepDefinition, TaskDefinition,
    WorkflowDefinition,
};
pub use graph::{
    is_ready, lint, parallel_groups, ready_steps, validate, StructuralError, ValidationWarning,
};
