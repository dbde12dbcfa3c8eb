// src/types.rs

//! Identifiers and the caller-supplied task descriptor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Canonical task identifier, unique within a batch.
pub type TaskId = String;

/// Canonical batch identifier (a UUID string for batches created by this crate).
pub type BatchId = String;

/// Immutable definition of one unit of work.
///
/// The core only reads `id`, `depends_on` and `budget`. `context` and
/// `payload` are handed to the executor untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,

    /// Working context for the executor (usually a directory).
    #[serde(default = "default_context")]
    pub context: PathBuf,

    /// Ids of tasks that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,

    /// Resource ceiling; once reported cost exceeds it the task is stopped
    /// and marked failed.
    #[serde(default)]
    pub budget: Option<f64>,

    /// Executor-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

impl TaskDescriptor {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            context: default_context(),
            depends_on: Vec::new(),
            budget: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn after(mut self, dep: impl Into<TaskId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
