//! Typed error hierarchy for the tether server.
//!
//! Two top-level enums cover the two stateful subsystems:
//! - `RegistryError` — project registration, lookup, and metadata durability
//! - `ExecutionError` — agent subprocess lifecycle failures
//!
//! Protocol-level failures (bad envelopes, unknown message types) are not
//! errors in this hierarchy; they are answered inline with an `error`
//! envelope and never escape the connection handler.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors from the project registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Path {path} overlaps registered project at {existing}: projects may not nest")]
    NestedPath { path: PathBuf, existing: PathBuf },

    #[error("Project {id} not found")]
    ProjectNotFound { id: Uuid },

    #[error("No project registered at {path}")]
    PathNotRegistered { path: PathBuf },

    #[error("Project {id} has an execution in progress")]
    ExecutionInProgress { id: Uuid },

    #[error("Failed to persist metadata at {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from a single agent execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Execution timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Agent process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Agent produced no parseable output")]
    MalformedOutput,

    #[error("Execution was killed")]
    Killed,

    #[error("No execution in progress for project {id}")]
    NotRunning { id: Uuid },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
