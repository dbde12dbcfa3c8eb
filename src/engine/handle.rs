// src/engine/handle.rs

use tokio::sync::{mpsc, oneshot, watch};

use crate::engine::ControlCommand;
use crate::errors::{BatchdagError, Result};
use crate::escalation::{EscalationCoordinator, EscalationRequest, EscalationResponse};
use crate::state::{BatchState, BatchStats};

/// Operator-facing side of a running [`Scheduler`](crate::engine::Scheduler).
///
/// Cheap to clone. Every request is delivered to the control loop, which
/// stays the only writer of the batch state; once the loop has exited,
/// requests fail with [`BatchdagError::NotRunning`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    control: mpsc::UnboundedSender<ControlCommand>,
    snapshot: watch::Receiver<BatchState>,
    escalations: EscalationCoordinator,
}

impl SchedulerHandle {
    pub(crate) fn new(
        control: mpsc::UnboundedSender<ControlCommand>,
        snapshot: watch::Receiver<BatchState>,
        escalations: EscalationCoordinator,
    ) -> Self {
        Self {
            control,
            snapshot,
            escalations,
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.send(ControlCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(ControlCommand::Resume)
    }

    pub fn cancel_all(&self) -> Result<()> {
        self.send(ControlCommand::CancelAll)
    }

    /// Stop the batch the way a crash would, but with a final save: running
    /// tasks are killed yet stay recorded `running`, so `resume` picks them
    /// up again with their sessions.
    pub fn interrupt(&self) -> Result<()> {
        self.send(ControlCommand::Interrupt)
    }

    /// Cancel one running task. Returns whether a running attempt was
    /// signalled.
    pub async fn cancel_task(&self, task: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::CancelTask {
            task: task.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| BatchdagError::NotRunning)?
    }

    /// Reset a failed task to pending.
    pub async fn retry_task(&self, task: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::RetryTask {
            task: task.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| BatchdagError::NotRunning)?
    }

    /// Answer the outstanding escalation of `task`.
    pub fn resolve_escalation(&self, task: &str, response: EscalationResponse) -> Result<()> {
        self.escalations.resolve(task, response)
    }

    pub fn pending_escalations(&self) -> Vec<EscalationRequest> {
        self.escalations.pending_requests()
    }

    /// The most recently published state.
    pub fn snapshot(&self) -> BatchState {
        self.snapshot.borrow().clone()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats::from_state(&self.snapshot.borrow())
    }

    /// Wait until a published state satisfies `predicate`.
    ///
    /// Fails with [`BatchdagError::NotRunning`] if the loop exits first and
    /// its final state does not match.
    pub async fn wait_for<P>(&self, mut predicate: P) -> Result<BatchState>
    where
        P: FnMut(&BatchState) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let state = rx
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| BatchdagError::NotRunning)?
            .clone();
        Ok(state)
    }

    fn send(&self, command: ControlCommand) -> Result<()> {
        self.control
            .send(command)
            .map_err(|_| BatchdagError::NotRunning)
    }
}
