//! Error Types
//!
//! Crate-level errors returned to callers. Step-level failures live in
//! [`crate::execution::invoker`] and graph validation errors in
//! [`crate::workflow::validator`].

use std::path::PathBuf;

use thiserror::Error;

use crate::workflow::plan::PlanError;
use crate::workflow::validator::ValidationError;

/// Errors from the engine's query and control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Unknown or evicted session ID
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// A caller-supplied session ID is already in use
    #[error("session '{0}' already exists")]
    SessionExists(String),
}

/// Errors from reading workflow, manifest or config files.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read '{path}': {source}. Check that the file exists and is readable")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {source}. Check the file format")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid document: {0}")]
    Document(#[from] serde_yaml::Error),
}

impl LoadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, source: serde_yaml::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the workflow orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}
