// src/engine/mod.rs

//! Orchestration engine for batchdag.
//!
//! This module ties together:
//! - the dependency graph resolver
//! - the batch state and its store
//! - the executors running admitted tasks
//! - the control loop that reacts to:
//!   - executor events (session, progress, tool use, cost, escalations, results)
//!   - operator commands (pause, resume, cancel, retry)
//!   - the autosave tick
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`], and [`handle`] is the operator-facing side of
//! a running batch.

use tokio::sync::oneshot;

use crate::errors::{ExecutionError, Result};
use crate::escalation::{EscalationRequest, EscalationResponse};
use crate::state::{BatchStats, BatchStatus};
use crate::types::{BatchId, TaskId};

pub mod core;
pub mod handle;
pub mod runtime;

pub use self::core::{BatchCore, CoreCommand, CoreStep};
pub use handle::SchedulerHandle;
pub use runtime::{BatchInit, Scheduler, SchedulerOptions};

/// How one task attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { result: String },
    Failed { error: String },
    Cancelled,
}

impl From<std::result::Result<String, ExecutionError>> for TaskOutcome {
    fn from(result: std::result::Result<String, ExecutionError>) -> Self {
        match result {
            Ok(result) => TaskOutcome::Completed { result },
            Err(ExecutionError::Failed(error)) => TaskOutcome::Failed { error },
            Err(ExecutionError::Cancelled) => TaskOutcome::Cancelled,
        }
    }
}

/// Events flowing into the control loop from running tasks.
///
/// Every event carries the attempt number it belongs to; the core drops
/// events from attempts that are no longer current.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    SessionStarted {
        task: TaskId,
        attempt: u32,
        token: String,
    },
    TaskProgressed {
        task: TaskId,
        attempt: u32,
        step: String,
    },
    ToolUsed {
        task: TaskId,
        attempt: u32,
        tool: String,
    },
    CostReported {
        task: TaskId,
        attempt: u32,
        delta: f64,
    },
    EscalationRaised {
        task: TaskId,
        attempt: u32,
        request: EscalationRequest,
        ticket: u64,
    },
    EscalationSettled {
        task: TaskId,
        attempt: u32,
        response: EscalationResponse,
    },
    /// The executor returned (or panicked).
    TaskFinished {
        task: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
    },
}

impl RuntimeEvent {
    pub fn task(&self) -> &str {
        match self {
            RuntimeEvent::SessionStarted { task, .. }
            | RuntimeEvent::TaskProgressed { task, .. }
            | RuntimeEvent::ToolUsed { task, .. }
            | RuntimeEvent::CostReported { task, .. }
            | RuntimeEvent::EscalationRaised { task, .. }
            | RuntimeEvent::EscalationSettled { task, .. }
            | RuntimeEvent::TaskFinished { task, .. } => task,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            RuntimeEvent::SessionStarted { attempt, .. }
            | RuntimeEvent::TaskProgressed { attempt, .. }
            | RuntimeEvent::ToolUsed { attempt, .. }
            | RuntimeEvent::CostReported { attempt, .. }
            | RuntimeEvent::EscalationRaised { attempt, .. }
            | RuntimeEvent::EscalationSettled { attempt, .. }
            | RuntimeEvent::TaskFinished { attempt, .. } => *attempt,
        }
    }
}

/// Operator requests delivered to the control loop by a [`SchedulerHandle`].
#[derive(Debug)]
pub enum ControlCommand {
    Pause,
    Resume,
    CancelAll,
    /// Stop the loop, leaving running tasks resumable.
    Interrupt,
    /// Replies whether a running task was signalled.
    CancelTask {
        task: TaskId,
        reply: oneshot::Sender<Result<bool>>,
    },
    RetryTask {
        task: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Events published by the control loop for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    BatchStarted {
        batch_id: BatchId,
        name: String,
        total_tasks: usize,
        resumed: bool,
    },
    BatchPaused,
    BatchResumed,
    TaskStarted {
        task: TaskId,
        attempt: u32,
        resumed_session: bool,
    },
    TaskProgress {
        task: TaskId,
        step: String,
    },
    TaskToolUse {
        task: TaskId,
        tool: String,
    },
    TaskCompleted {
        task: TaskId,
        result: String,
        cost: f64,
    },
    TaskFailed {
        task: TaskId,
        error: String,
    },
    TaskCancelled {
        task: TaskId,
    },
    EscalationRaised {
        request: EscalationRequest,
    },
    EscalationResolved {
        task: TaskId,
        response: EscalationResponse,
    },
    /// Pending tasks that can never become ready.
    DeadlockDetected {
        blocked: Vec<TaskId>,
    },
    StateUpdated {
        stats: BatchStats,
    },
    /// The loop stopped with these tasks still recorded `running`.
    BatchInterrupted {
        batch_id: BatchId,
        running: Vec<TaskId>,
    },
    BatchCompleted {
        batch_id: BatchId,
        status: BatchStatus,
        stats: BatchStats,
    },
}
