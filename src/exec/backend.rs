// src/exec/backend.rs

//! Pluggable executor abstraction.
//!
//! The scheduler never runs work itself. For every admitted task it builds a
//! [`TaskRun`] plus an [`ExecutionContext`] and hands both to an
//! [`Executor`]. The context is the executor's only way back into the
//! scheduler:
//!
//! - `session_started` / `progress` / `tool_use` / `report_cost` emit
//!   [`RuntimeEvent`]s into the control loop,
//! - `escalate` parks the task on the [`EscalationCoordinator`],
//! - the [`CancelSignal`] tells the executor to stop.
//!
//! Tests provide their own `Executor` that doesn't spawn processes; the
//! production implementation is [`crate::exec::command::ShellExecutor`].

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::engine::RuntimeEvent;
use crate::errors::{ExecutionError, Result};
use crate::escalation::{EscalationCoordinator, EscalationRequest, EscalationResponse};
use crate::types::{TaskDescriptor, TaskId};

/// Future returned by [`Executor::run`].
pub type ExecFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<String, ExecutionError>> + Send + 'a>>;

/// Trait abstracting how one task attempt is executed.
pub trait Executor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run one attempt to completion.
    ///
    /// Resolves to the task's result text, or an [`ExecutionError`]. Must
    /// return promptly with [`ExecutionError::Cancelled`] once the context's
    /// cancel signal fires.
    fn run<'a>(&'a self, run: TaskRun, ctx: ExecutionContext) -> ExecFuture<'a>;
}

/// One admitted attempt of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRun {
    pub descriptor: TaskDescriptor,
    /// Session token from an earlier attempt; `None` starts a fresh session.
    pub resume_token: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl TaskRun {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// The same attempt without its resume token.
    pub fn fresh(&self) -> TaskRun {
        TaskRun {
            resume_token: None,
            ..self.clone()
        }
    }
}

/// Create a connected cancel handle / signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Scheduler side of a task's cancellation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. Calling it more than once is harmless.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Executor side of a task's cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Everything an executor may use to talk back to the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    task_id: TaskId,
    attempt: u32,
    events: mpsc::Sender<RuntimeEvent>,
    escalations: EscalationCoordinator,
    cancel: CancelSignal,
}

impl ExecutionContext {
    pub fn new(
        task_id: impl Into<TaskId>,
        attempt: u32,
        events: mpsc::Sender<RuntimeEvent>,
        escalations: EscalationCoordinator,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            attempt,
            events,
            escalations,
            cancel,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Record the session token the task can later be resumed with.
    pub async fn session_started(&self, token: impl Into<String>) {
        self.emit(RuntimeEvent::SessionStarted {
            task: self.task_id.clone(),
            attempt: self.attempt,
            token: token.into(),
        })
        .await;
    }

    pub async fn progress(&self, step: impl Into<String>) {
        self.emit(RuntimeEvent::TaskProgressed {
            task: self.task_id.clone(),
            attempt: self.attempt,
            step: step.into(),
        })
        .await;
    }

    pub async fn tool_use(&self, tool: impl Into<String>) {
        self.emit(RuntimeEvent::ToolUsed {
            task: self.task_id.clone(),
            attempt: self.attempt,
            tool: tool.into(),
        })
        .await;
    }

    /// Add `delta` to the task's accumulated cost.
    pub async fn report_cost(&self, delta: f64) {
        self.emit(RuntimeEvent::CostReported {
            task: self.task_id.clone(),
            attempt: self.attempt,
            delta,
        })
        .await;
    }

    /// Ask the operator for a decision and wait for it.
    ///
    /// Only this task waits. If the task is cancelled while waiting the
    /// result is [`EscalationResponse::Skip`].
    pub async fn escalate(&self, mut request: EscalationRequest) -> Result<EscalationResponse> {
        request.task_id = self.task_id.clone();
        let registration = self.escalations.register(request.clone())?;

        self.emit(RuntimeEvent::EscalationRaised {
            task: self.task_id.clone(),
            attempt: self.attempt,
            request,
            ticket: registration.ticket,
        })
        .await;

        let response = tokio::select! {
            answer = registration.response => answer.unwrap_or(EscalationResponse::Skip),
            _ = self.cancel.cancelled() => {
                self.escalations.cancel(&self.task_id);
                EscalationResponse::Skip
            }
        };

        self.emit(RuntimeEvent::EscalationSettled {
            task: self.task_id.clone(),
            attempt: self.attempt,
            response: response.clone(),
        })
        .await;

        Ok(response)
    }

    async fn emit(&self, event: RuntimeEvent) {
        if self.events.send(event).await.is_err() {
            debug!(task = %self.task_id, "control loop has stopped; dropping task event");
        }
    }
}
