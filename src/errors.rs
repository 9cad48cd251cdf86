//! Typed error hierarchy for the cloudforge orchestrator.
//!
//! Two top-level enums cover the two subsystems:
//! - `WorkflowError` — workflow definition loading and parsing failures
//! - `OrchestratorError` — scheduler and persistence failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading or parsing the workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow definition yielded no phases")]
    Empty,

    #[error("failed to read workflow file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to write state file at {path}: {source}")]
    StateWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
