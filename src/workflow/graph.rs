//! # Dependency Graph Resolver
//!
//! Pure functions over step dependency graphs: structural validation (fatal),
//! lint warnings (advisory), readiness queries, and topological leveling for
//! parallel execution planning.
//!
//! ## Overview
//!
//! The resolver holds no state of its own. Validation runs once before a
//! workflow is accepted for monitoring; readiness is re-evaluated every sprint
//! against the live status map. Cycle detection uses a white/gray/black DFS so
//! a gray-node revisit identifies the cycle entry point.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{EnsembleError, Result};
use crate::workflow::definition::{ExecutionStatus, StepDefinition, WorkflowDefinition};

/// Fatal structural problems. A workflow with any of these must not start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    #[error("circular dependency involving step '{0}'")]
    CircularDependency(String),
}

/// Advisory problems. Logged at startup, never block execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    DuplicateDependencyEntry { step: String, dependency: String },
    UnknownAgent { step: String, agent: String },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::DuplicateDependencyEntry { step, dependency } => {
                write!(f, "step '{step}' lists dependency '{dependency}' more than once")
            }
            ValidationWarning::UnknownAgent { step, agent } => {
                write!(f, "step '{step}' references agent '{agent}' not in the workflow roster")
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validate the structural integrity of a step list: unique names, resolvable
/// dependencies, and an acyclic dependency relation.
///
/// All problems are collected and returned together so authors can fix a
/// workflow in one pass.
pub fn validate(steps: &[StepDefinition]) -> Vec<StructuralError> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.name.as_str()) {
            errors.push(StructuralError::DuplicateStep(step.name.clone()));
        }
    }

    let index: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.name.as_str(), s)).collect();

    for step in steps {
        for dependency in &step.depends_on {
            if !index.contains_key(dependency.as_str()) {
                errors.push(StructuralError::MissingDependency {
                    step: step.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    // Cycle detection over the edges that resolve. Missing dependencies were
    // already reported above and are skipped here.
    let mut colors: HashMap<&str, Color> = HashMap::new();
    for step in steps {
        if colors.get(step.name.as_str()).copied().unwrap_or(Color::White) == Color::White {
            if let Some(entry) = visit(step.name.as_str(), &index, &mut colors) {
                errors.push(StructuralError::CircularDependency(entry.to_string()));
            }
        }
    }

    errors
}

/// Returns the gray node revisited when a cycle is found; that node is on the
/// cycle even when the DFS root is not. The path is blackened as the error
/// unwinds so steps that merely depend on a cycle are not reported again.
fn visit<'a>(
    name: &'a str,
    index: &HashMap<&'a str, &'a StepDefinition>,
    colors: &mut HashMap<&'a str, Color>,
) -> Option<&'a str> {
    match colors.get(name) {
        Some(Color::Gray) => return Some(name),
        Some(Color::Black) => return None,
        _ => {}
    }
    colors.insert(name, Color::Gray);

    if let Some(step) = index.get(name) {
        for dependency in &step.depends_on {
            if index.contains_key(dependency.as_str()) {
                if let Some(entry) = visit(dependency, index, colors) {
                    colors.insert(name, Color::Black);
                    return Some(entry);
                }
            }
        }
    }

    colors.insert(name, Color::Black);
    None
}

/// Lint a workflow for non-fatal issues: duplicate dependency entries and
/// step agents missing from the roster.
pub fn lint(workflow: &WorkflowDefinition) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let roster: HashSet<&str> = workflow.agents.iter().map(|a| a.name.as_str()).collect();

    for step in &workflow.steps {
        let mut seen = HashSet::new();
        for dependency in &step.depends_on {
            if !seen.insert(dependency.as_str()) {
                warnings.push(ValidationWarning::DuplicateDependencyEntry {
                    step: step.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        if let Some(agent) = &step.agent {
            if !roster.is_empty() && !roster.contains(agent.as_str()) {
                warnings.push(ValidationWarning::UnknownAgent {
                    step: step.name.clone(),
                    agent: agent.clone(),
                });
            }
        }
    }

    warnings
}

/// A step is ready when it has no dependencies, or every dependency has
/// completed. A failed dependency never yields readiness.
pub fn is_ready(step: &StepDefinition, statuses: &HashMap<String, ExecutionStatus>) -> bool {
    step.depends_on
        .iter()
        .all(|dependency| statuses.get(dependency) == Some(&ExecutionStatus::Completed))
}

/// Steps that are still pending (or have no recorded status) and whose
/// dependencies are all completed.
pub fn ready_steps<'a>(
    steps: &'a [StepDefinition],
    statuses: &HashMap<String, ExecutionStatus>,
) -> Vec<&'a StepDefinition> {
    steps
        .iter()
        .filter(|step| {
            let pending = matches!(
                statuses.get(&step.name),
                None | Some(ExecutionStatus::Pending)
            );
            pending && is_ready(step, statuses)
        })
        .collect()
}

/// Level the steps into sequential groups of parallelizable work: every step
/// in group N depends only on steps in groups 0..N. Used for dry-run plans
/// and batch sizing.
///
/// Dependencies that do not resolve to a step are ignored here (they are a
/// [`validate`] concern); a cycle is an error naming the unschedulable steps.
pub fn parallel_groups(steps: &[StepDefinition]) -> Result<Vec<Vec<&StepDefinition>>> {
    let index: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut scheduled: HashSet<&str> = HashSet::new();
    let mut groups: Vec<Vec<&StepDefinition>> = Vec::new();

    while scheduled.len() < steps.len() {
        let wave: Vec<&StepDefinition> = steps
            .iter()
            .filter(|step| {
                !scheduled.contains(step.name.as_str())
                    && step.depends_on.iter().all(|dependency| {
                        scheduled.contains(dependency.as_str())
                            || !index.contains_key(dependency.as_str())
                    })
            })
            .collect();

        if wave.is_empty() {
            let nodes = steps
                .iter()
                .filter(|s| !scheduled.contains(s.name.as_str()))
                .map(|s| s.name.clone())
                .collect();
            return Err(EnsembleError::DependencyCycle { nodes });
        }

        for step in &wave {
            scheduled.insert(step.name.as_str());
        }
        groups.push(wave);
    }

    Ok(groups)
}
