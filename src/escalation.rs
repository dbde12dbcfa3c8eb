// src/escalation.rs

//! Escalation coordination.
//!
//! A running task may stop and ask the operator for a decision. The task's
//! executor calls [`EscalationCoordinator::raise`], which parks only that
//! task until someone calls [`EscalationCoordinator::resolve`] with the same
//! task id. The scheduler's control loop and every other task keep going.
//!
//! At most one request may be outstanding per task. The core enforces no
//! timeout; the scheduler can layer one on top through
//! [`EscalationCoordinator::resolve_ticket`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::{BatchdagError, Result};
use crate::types::TaskId;

/// A task's request for an external decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    #[serde(default)]
    pub task_id: TaskId,
    /// Short machine-readable tag, e.g. `"ambiguous-requirement"`.
    #[serde(default)]
    pub reason: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl EscalationRequest {
    pub fn new(task_id: impl Into<TaskId>, question: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            reason: String::new(),
            question: question.into(),
            choices: Vec::new(),
            context: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }
}

/// The operator's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EscalationResponse {
    /// One of the offered choices, by its text.
    Choice(String),
    FreeText(String),
    /// Let the task pick on its own.
    AgentDecide,
    /// Skip the task.
    Skip,
}

impl fmt::Display for EscalationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationResponse::Choice(c) => write!(f, "choice '{c}'"),
            EscalationResponse::FreeText(t) => write!(f, "answer '{t}'"),
            EscalationResponse::AgentDecide => f.write_str("let the task decide"),
            EscalationResponse::Skip => f.write_str("skip"),
        }
    }
}

struct PendingSlot {
    ticket: u64,
    request: EscalationRequest,
    reply: oneshot::Sender<EscalationResponse>,
}

/// A registered request: its ticket plus the receiving end of its slot.
pub struct Registration {
    pub ticket: u64,
    pub response: oneshot::Receiver<EscalationResponse>,
}

/// Correlates outstanding requests with their pending response slots.
///
/// Cheap to clone; all clones share the same slots.
#[derive(Clone, Default)]
pub struct EscalationCoordinator {
    slots: Arc<Mutex<HashMap<TaskId, PendingSlot>>>,
    tickets: Arc<AtomicU64>,
}

impl fmt::Debug for EscalationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationCoordinator")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl EscalationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<TaskId, PendingSlot>> {
        // A poisoned map is still structurally valid.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `request` and wait for its response.
    ///
    /// Blocks only the caller. Fails with
    /// [`BatchdagError::EscalationAlreadyPending`] if the task already has an
    /// outstanding request. If the slot is dropped without an answer the
    /// caller receives [`EscalationResponse::Skip`].
    pub async fn raise(&self, request: EscalationRequest) -> Result<EscalationResponse> {
        let registration = self.register(request)?;
        Ok(registration
            .response
            .await
            .unwrap_or(EscalationResponse::Skip))
    }

    /// Register `request` without waiting; the caller awaits the returned
    /// receiver itself.
    pub fn register(&self, request: EscalationRequest) -> Result<Registration> {
        let mut slots = self.slots();
        if let Some(existing) = slots.get(&request.task_id) {
            // A slot whose waiter has gone away no longer counts.
            if !existing.reply.is_closed() {
                return Err(BatchdagError::EscalationAlreadyPending(
                    request.task_id.clone(),
                ));
            }
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        info!(
            task = %request.task_id,
            ticket,
            reason = %request.reason,
            "escalation raised"
        );
        slots.insert(
            request.task_id.clone(),
            PendingSlot {
                ticket,
                request,
                reply: tx,
            },
        );

        Ok(Registration {
            ticket,
            response: rx,
        })
    }

    /// Hand `response` to the task waiting on `task_id`.
    ///
    /// Resolving an id with no outstanding request is reported as
    /// [`BatchdagError::StaleEscalationResolution`] and changes nothing.
    pub fn resolve(&self, task_id: &str, response: EscalationResponse) -> Result<()> {
        let slot = self.slots().remove(task_id);
        match slot {
            Some(slot) => Self::deliver(task_id, slot, response),
            None => {
                warn!(task = %task_id, "resolution for a task with no pending escalation");
                Err(BatchdagError::StaleEscalationResolution(task_id.to_string()))
            }
        }
    }

    /// Like [`resolve`](Self::resolve), but only if the outstanding request is
    /// still the one identified by `ticket`. Used by timers so a late
    /// timeout never answers a newer request.
    pub fn resolve_ticket(
        &self,
        task_id: &str,
        ticket: u64,
        response: EscalationResponse,
    ) -> Result<()> {
        let slot = {
            let mut slots = self.slots();
            match slots.get(task_id) {
                Some(slot) if slot.ticket == ticket => slots.remove(task_id),
                _ => None,
            }
        };
        match slot {
            Some(slot) => Self::deliver(task_id, slot, response),
            None => {
                debug!(task = %task_id, ticket, "escalation ticket already settled");
                Err(BatchdagError::StaleEscalationResolution(task_id.to_string()))
            }
        }
    }

    /// Release a cancelled task's wait with a synthetic [`EscalationResponse::Skip`].
    ///
    /// Returns whether a request was outstanding. Calling it twice is harmless.
    pub fn cancel(&self, task_id: &str) -> bool {
        let slot = self.slots().remove(task_id);
        match slot {
            Some(slot) => {
                debug!(task = %task_id, "cancelling pending escalation");
                let _ = slot.reply.send(EscalationResponse::Skip);
                true
            }
            None => false,
        }
    }

    /// The outstanding request for `task_id`, if any.
    pub fn pending(&self, task_id: &str) -> Option<EscalationRequest> {
        self.slots().get(task_id).map(|s| s.request.clone())
    }

    /// All outstanding requests, ordered by task id.
    pub fn pending_requests(&self) -> Vec<EscalationRequest> {
        let mut requests: Vec<_> = self.slots().values().map(|s| s.request.clone()).collect();
        requests.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        requests
    }

    pub fn outstanding(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.slots().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn deliver(task_id: &str, slot: PendingSlot, response: EscalationResponse) -> Result<()> {
        info!(task = %task_id, ticket = slot.ticket, %response, "escalation resolved");
        slot.reply
            .send(response)
            .map_err(|_| BatchdagError::StaleEscalationResolution(task_id.to_string()))
    }
}
