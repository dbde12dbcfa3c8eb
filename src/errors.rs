// src/errors.rs

//! Crate-wide error types.
//!
//! [`BatchdagError`] covers batch-level failures (graph validation,
//! persistence, invalid operator requests). Per-task failures never use it:
//! executors return an [`ExecutionError`], which the scheduler records into
//! the task's runtime state instead of propagating.

use thiserror::Error;

use crate::state::TaskStatus;

#[derive(Error, Debug)]
pub enum BatchdagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("No pending escalation for task '{0}'")]
    StaleEscalationResolution(String),

    #[error("Task '{0}' already has a pending escalation")]
    EscalationAlreadyPending(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a single task attempt did not produce a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, BatchdagError>;
