// src/state/model.rs

//! Runtime state of a batch and its tasks.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::DagGraph;
use crate::errors::{BatchdagError, Result};
use crate::escalation::EscalationRequest;
use crate::types::{BatchId, TaskId};

/// Stored per-task status.
///
/// Allowed transitions:
///
/// ```text
/// pending -> running -> completed | failed | cancelled
/// failed  -> pending   (explicit retry)
/// ```
///
/// Resuming after a crash also moves `running` back to `pending`; that is
/// done by the state store when loading, not through [`BatchState::transition`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Running)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Presentational refinement of [`TaskStatus`]; `Blocked` and `Queued`
/// split `pending` by whether the dependencies are already met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    /// Pending, still waiting on unmet dependencies.
    Blocked,
    /// Pending, dependencies met, waiting for a free slot.
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisplayStatus::Blocked => "blocked",
            DisplayStatus::Queued => "queued",
            DisplayStatus::Running => "running",
            DisplayStatus::Completed => "completed",
            DisplayStatus::Failed => "failed",
            DisplayStatus::Cancelled => "cancelled",
        };
        f.pad(s)
    }
}

/// Overall batch status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        };
        f.pad(s)
    }
}

/// Mutable record of one task's progress through execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRuntimeState {
    pub status: TaskStatus,
    /// Opaque resumable-session token, present once the task has started.
    pub session_token: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated cost over every attempt.
    pub cost: f64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub current_step: Option<String>,
    pub last_tool: Option<String>,
    /// Number of times the task has been started.
    pub attempts: u32,
    /// Decision request the task is currently blocked on, if any.
    pub pending_escalation: Option<EscalationRequest>,
}

/// Partial update merged into a [`TaskRuntimeState`].
///
/// `None` leaves a field untouched. For optional fields, `Some(None)`
/// clears the field.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub session_token: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub cost: Option<f64>,
    pub result: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub current_step: Option<Option<String>>,
    pub last_tool: Option<Option<String>>,
    pub attempts: Option<u32>,
    pub pending_escalation: Option<Option<EscalationRequest>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    fn merge_into(self, task: &mut TaskRuntimeState) {
        if let Some(v) = self.status {
            task.status = v;
        }
        if let Some(v) = self.session_token {
            task.session_token = v;
        }
        if let Some(v) = self.started_at {
            task.started_at = v;
        }
        if let Some(v) = self.completed_at {
            task.completed_at = v;
        }
        if let Some(v) = self.cost {
            task.cost = v;
        }
        if let Some(v) = self.result {
            task.result = v;
        }
        if let Some(v) = self.error {
            task.error = v;
        }
        if let Some(v) = self.current_step {
            task.current_step = v;
        }
        if let Some(v) = self.last_tool {
            task.last_tool = v;
        }
        if let Some(v) = self.attempts {
            task.attempts = v;
        }
        if let Some(v) = self.pending_escalation {
            task.pending_escalation = v;
        }
    }
}

/// Where the batch's task list came from, so it can be rebuilt on resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: PathBuf,
    /// blake3 digest (hex) of the task-list file at batch creation.
    pub digest: String,
}

impl SourceRef {
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: &[u8]) -> Self {
        Self {
            path: path.into(),
            digest: blake3::hash(bytes).to_hex().to_string(),
        }
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        blake3::hash(bytes).to_hex().as_str() == self.digest
    }
}

/// Aggregate root for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: BatchId,
    pub name: String,
    pub source: SourceRef,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    /// Always equal to the sum of the per-task costs.
    pub total_cost: f64,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Pending tasks that could never become ready when the batch ended.
    #[serde(default)]
    pub deadlocked: Vec<TaskId>,
    pub tasks: BTreeMap<TaskId, TaskRuntimeState>,
}

impl BatchState {
    pub fn task(&self, id: &str) -> Option<&TaskRuntimeState> {
        self.tasks.get(id)
    }

    /// Ids of tasks currently in `status`.
    pub fn ids_with_status(&self, status: TaskStatus) -> HashSet<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Merge `update` into one task, keeping `total_cost` consistent.
    pub fn apply(&mut self, id: &str, update: TaskUpdate) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| BatchdagError::TaskNotFound(id.to_string()))?;
        update.merge_into(task);
        self.recompute_total_cost();
        Ok(())
    }

    /// Move a task to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, id: &str, next: TaskStatus) -> Result<()> {
        let current = self
            .task(id)
            .map(|t| t.status)
            .ok_or_else(|| BatchdagError::TaskNotFound(id.to_string()))?;
        if !current.can_transition_to(next) {
            return Err(BatchdagError::InvalidTransition {
                task: id.to_string(),
                from: current,
                to: next,
            });
        }
        self.apply(id, TaskUpdate::status(next))
    }

    /// Reset a failed task to pending, clearing its error but keeping the
    /// session token so the executor can continue the same session.
    pub fn reset_for_retry(&mut self, id: &str) -> Result<()> {
        let current = self
            .task(id)
            .map(|t| t.status)
            .ok_or_else(|| BatchdagError::TaskNotFound(id.to_string()))?;
        if current != TaskStatus::Failed {
            return Err(BatchdagError::InvalidTransition {
                task: id.to_string(),
                from: current,
                to: TaskStatus::Pending,
            });
        }
        self.apply(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Pending),
                error: Some(None),
                result: Some(None),
                completed_at: Some(None),
                current_step: Some(None),
                ..TaskUpdate::default()
            },
        )
    }

    pub fn recompute_total_cost(&mut self) {
        self.total_cost = self.tasks.values().map(|t| t.cost).sum();
    }

    /// Presentational status of one task against the dependency graph.
    pub fn display_status(&self, graph: &DagGraph, id: &str) -> Option<DisplayStatus> {
        let task = self.task(id)?;
        let status = match task.status {
            TaskStatus::Pending => {
                let deps_met = graph.dependencies_of(id).iter().all(|dep| {
                    self.task(dep)
                        .is_some_and(|t| t.status == TaskStatus::Completed)
                });
                if deps_met {
                    DisplayStatus::Queued
                } else {
                    DisplayStatus::Blocked
                }
            }
            TaskStatus::Running => DisplayStatus::Running,
            TaskStatus::Completed => DisplayStatus::Completed,
            TaskStatus::Failed => DisplayStatus::Failed,
            TaskStatus::Cancelled => DisplayStatus::Cancelled,
        };
        Some(status)
    }
}

/// Aggregated counts, recomputed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_cost: f64,
}

impl BatchStats {
    pub fn from_state(state: &BatchState) -> Self {
        let mut stats = BatchStats {
            total: state.tasks.len(),
            ..BatchStats::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_cost += task.cost;
        }
        stats
    }
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} pending, {} running, {} completed, {} failed, {} cancelled; cost {:.4}",
            self.total,
            self.pending,
            self.running,
            self.completed,
            self.failed,
            self.cancelled,
            self.total_cost
        )
    }
}
