use std::path::PathBuf;

use crate::workflow::graph::StructuralError;

/// Errors surfaced by the orchestration engine.
///
/// Component-internal failures (agent errors inside a retry sequence, storage
/// hiccups on the cache read path) are absorbed and logged where the design
/// calls for graceful degradation; only failures the caller must act on
/// become an `EnsembleError`.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// The workflow failed structural validation and must not start.
    #[error("workflow validation failed: {}", format_errors(errors))]
    Validation { errors: Vec<StructuralError> },

    /// The dependency graph contains at least one cycle. The listed steps
    /// are the ones that could never be scheduled.
    #[error("dependency cycle detected involving steps: {}", nodes.join(", "))]
    DependencyCycle { nodes: Vec<String> },

    /// `start_monitoring` was called for a workflow that already has an
    /// active sprint loop.
    #[error("workflow '{0}' is already being monitored")]
    AlreadyMonitored(String),

    /// An update was requested but no checkpoint is currently active.
    #[error("no active checkpoint to update")]
    NoActiveCheckpoint,

    /// Every configured checkpoint backend rejected the save.
    #[error("all checkpoint backends failed to save: {0}")]
    CheckpointSaveFailed(String),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_errors(errors: &[StructuralError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, EnsembleError>;
