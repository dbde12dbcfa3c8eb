// src/engine/core.rs

//! Pure core state machine of the scheduler.
//!
//! [`BatchCore`] is the single writer of a batch's [`BatchState`]. It
//! consumes executor events and operator requests and produces:
//! - an updated state
//! - a list of [`CoreCommand`]s describing what the IO shell should do next
//!
//! It has no channels, no Tokio types, and does no IO. The current time is
//! passed in, so the core can be unit tested deterministically.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::dag::DagGraph;
use crate::engine::{LifecycleEvent, RuntimeEvent, TaskOutcome};
use crate::errors::{BatchdagError, Result};
use crate::exec::TaskRun;
use crate::state::{BatchState, BatchStats, BatchStatus, TaskRuntimeState, TaskStatus, TaskUpdate};
use crate::types::{TaskDescriptor, TaskId};

/// Error recorded on a task whose reported cost went past its budget.
pub const BUDGET_EXCEEDED: &str = "budget exceeded";

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
    /// Start these attempts.
    Dispatch(Vec<TaskRun>),
    /// Signal these running tasks to stop.
    Cancel(Vec<TaskId>),
    /// Publish a lifecycle event.
    Emit(LifecycleEvent),
    /// Save the state now.
    Persist,
    /// Arm the escalation auto-resolve timer for this request, if one is
    /// configured.
    ScheduleEscalationExpiry { task: TaskId, ticket: u64 },
}

/// Decision returned by the core after handling one input.
#[derive(Debug, Clone, Default)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer control loop should keep running.
    pub keep_running: bool,
}

/// Pure scheduler state.
#[derive(Debug)]
pub struct BatchCore {
    graph: DagGraph,
    descriptors: HashMap<TaskId, TaskDescriptor>,
    state: BatchState,
    concurrency: usize,
    /// Running tasks and their current attempt number.
    running: HashMap<TaskId, u32>,
    /// Running tasks whose stop was requested by an operator.
    cancelling: HashSet<TaskId>,
    /// Running tasks stopped for exceeding their budget.
    over_budget: HashSet<TaskId>,
    paused: bool,
    dirty: bool,
    finished: bool,
}

impl BatchCore {
    /// Build a core over a validated graph and a state holding one entry per
    /// task (see [`reconcile_tasks`]).
    ///
    /// `state` must not contain `running` tasks; reloaded state goes through
    /// the resume rule first.
    pub fn new(
        graph: DagGraph,
        descriptors: Vec<TaskDescriptor>,
        state: BatchState,
        concurrency: usize,
    ) -> Self {
        let descriptors = descriptors
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Self {
            graph,
            descriptors,
            state,
            concurrency: concurrency.max(1),
            running: HashMap::new(),
            cancelling: HashSet::new(),
            over_budget: HashSet::new(),
            paused: false,
            dirty: false,
            finished: false,
        }
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn into_state(self) -> BatchState {
        self.state
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn running(&self) -> HashSet<TaskId> {
        self.running.keys().cloned().collect()
    }

    /// The attempt currently running for `task`, if any.
    pub fn running_attempt(&self, task: &str) -> Option<u32> {
        self.running.get(task).copied()
    }

    /// Whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Pending tasks whose dependencies are all completed, in declaration
    /// order.
    pub fn ready(&self) -> Vec<TaskId> {
        let completed = self.state.ids_with_status(TaskStatus::Completed);
        let running = self.running();
        self.graph
            .ready_set(&completed, &running)
            .into_iter()
            .filter(|id| {
                self.state
                    .task(id)
                    .is_some_and(|t| t.status == TaskStatus::Pending)
            })
            .collect()
    }

    /// Start (or restart) the batch.
    pub fn begin(&mut self, now: DateTime<Utc>, resumed: bool) -> CoreStep {
        let mut commands = Vec::new();

        self.state.status = BatchStatus::Running;
        self.state.started_at.get_or_insert(now);
        self.state.completed_at = None;
        self.state.cancel_requested = false;
        self.state.deadlocked.clear();

        info!(
            batch_id = %self.state.batch_id,
            name = %self.state.name,
            tasks = self.state.tasks.len(),
            concurrency = self.concurrency,
            resumed,
            "batch started"
        );
        commands.push(CoreCommand::Emit(LifecycleEvent::BatchStarted {
            batch_id: self.state.batch_id.clone(),
            name: self.state.name.clone(),
            total_tasks: self.state.tasks.len(),
            resumed,
        }));
        commands.push(CoreCommand::Persist);

        let keep_running = self.settle(now, &mut commands);
        CoreStep {
            commands,
            keep_running,
        }
    }

    /// Apply one executor event.
    pub fn handle_event(&mut self, event: RuntimeEvent, now: DateTime<Utc>) -> CoreStep {
        let mut commands = Vec::new();

        if self.finished || self.running.get(event.task()) != Some(&event.attempt()) {
            debug!(
                task = %event.task(),
                attempt = event.attempt(),
                "ignoring event from an attempt that is no longer running"
            );
            return CoreStep {
                commands,
                keep_running: !self.finished,
            };
        }

        match event {
            RuntimeEvent::SessionStarted { task, token, .. } => {
                self.update(
                    &task,
                    TaskUpdate {
                        session_token: Some(Some(token)),
                        ..TaskUpdate::default()
                    },
                );
                commands.push(CoreCommand::Persist);
            }
            RuntimeEvent::TaskProgressed { task, step, .. } => {
                self.update(
                    &task,
                    TaskUpdate {
                        current_step: Some(Some(step.clone())),
                        ..TaskUpdate::default()
                    },
                );
                commands.push(CoreCommand::Emit(LifecycleEvent::TaskProgress { task, step }));
            }
            RuntimeEvent::ToolUsed { task, tool, .. } => {
                self.update(
                    &task,
                    TaskUpdate {
                        last_tool: Some(Some(tool.clone())),
                        ..TaskUpdate::default()
                    },
                );
                commands.push(CoreCommand::Emit(LifecycleEvent::TaskToolUse { task, tool }));
            }
            RuntimeEvent::CostReported { task, delta, .. } => {
                self.add_cost(&task, delta, &mut commands);
            }
            RuntimeEvent::EscalationRaised {
                task,
                request,
                ticket,
                ..
            } => {
                self.update(
                    &task,
                    TaskUpdate {
                        pending_escalation: Some(Some(request.clone())),
                        ..TaskUpdate::default()
                    },
                );
                commands.push(CoreCommand::Emit(LifecycleEvent::EscalationRaised { request }));
                commands.push(CoreCommand::ScheduleEscalationExpiry { task, ticket });
            }
            RuntimeEvent::EscalationSettled { task, response, .. } => {
                self.update(
                    &task,
                    TaskUpdate {
                        pending_escalation: Some(None),
                        ..TaskUpdate::default()
                    },
                );
                commands.push(CoreCommand::Emit(LifecycleEvent::EscalationResolved {
                    task,
                    response,
                }));
            }
            RuntimeEvent::TaskFinished { task, outcome, .. } => {
                self.finish_task(&task, outcome, now, &mut commands);
            }
        }

        let keep_running = self.settle(now, &mut commands);
        CoreStep {
            commands,
            keep_running,
        }
    }

    /// Close the admission gate. Running tasks are unaffected.
    pub fn pause(&mut self) -> CoreStep {
        let mut commands = Vec::new();
        if !self.paused && !self.finished {
            self.paused = true;
            info!(batch_id = %self.state.batch_id, "batch paused");
            commands.push(CoreCommand::Emit(LifecycleEvent::BatchPaused));
        }
        CoreStep {
            commands,
            keep_running: !self.finished,
        }
    }

    /// Reopen the admission gate and admit whatever is ready.
    pub fn resume(&mut self, now: DateTime<Utc>) -> CoreStep {
        let mut commands = Vec::new();
        if self.paused {
            self.paused = false;
            info!(batch_id = %self.state.batch_id, "batch resumed");
            commands.push(CoreCommand::Emit(LifecycleEvent::BatchResumed));
        }
        let keep_running = self.settle(now, &mut commands);
        CoreStep {
            commands,
            keep_running,
        }
    }

    /// Signal one running task to stop; its terminal status will be
    /// `cancelled`.
    ///
    /// Returns `false` when the task exists but is not running (including a
    /// second cancel of the same task).
    pub fn cancel_task(&mut self, task: &str) -> Result<(bool, CoreStep)> {
        if self.state.task(task).is_none() {
            return Err(BatchdagError::TaskNotFound(task.to_string()));
        }

        let mut commands = Vec::new();
        let signalled = self.running.contains_key(task) && self.cancelling.insert(task.to_string());
        if signalled {
            info!(task = %task, "cancelling task");
            commands.push(CoreCommand::Cancel(vec![task.to_string()]));
        } else {
            debug!(task = %task, "cancel ignored; task is not running or already cancelling");
        }

        Ok((
            signalled,
            CoreStep {
                commands,
                keep_running: !self.finished,
            },
        ))
    }

    /// Cancel every running task and stop admitting; the batch ends
    /// `cancelled` once nothing is running.
    pub fn cancel_all(&mut self, now: DateTime<Utc>) -> CoreStep {
        let mut commands = Vec::new();

        if !self.finished && !self.state.cancel_requested {
            self.state.cancel_requested = true;
            self.dirty = true;
            info!(
                batch_id = %self.state.batch_id,
                running = self.running.len(),
                "cancelling batch"
            );
            commands.push(CoreCommand::Persist);
        }

        let mut to_cancel = Vec::new();
        for id in self.graph.tasks() {
            if self.running.contains_key(id) && self.cancelling.insert(id.to_string()) {
                to_cancel.push(id.to_string());
            }
        }
        if !to_cancel.is_empty() {
            commands.push(CoreCommand::Cancel(to_cancel));
        }

        let keep_running = self.settle(now, &mut commands);
        CoreStep {
            commands,
            keep_running,
        }
    }

    /// Stop driving the batch without settling it.
    ///
    /// Running tasks stay recorded `running` and the batch stays `running`,
    /// so a later resume turns them back into `pending` with their session
    /// tokens. The shell still signals the live attempts to stop.
    pub fn interrupt(&mut self) -> CoreStep {
        let mut commands = Vec::new();
        if self.finished {
            return CoreStep {
                commands,
                keep_running: false,
            };
        }
        self.finished = true;

        let running: Vec<TaskId> = self
            .graph
            .tasks()
            .filter(|id| self.running.contains_key(*id))
            .map(str::to_string)
            .collect();
        info!(
            batch_id = %self.state.batch_id,
            tasks = ?running,
            "batch interrupted; running tasks left resumable"
        );

        commands.push(CoreCommand::Persist);
        commands.push(CoreCommand::Emit(LifecycleEvent::BatchInterrupted {
            batch_id: self.state.batch_id.clone(),
            running: running.clone(),
        }));
        if !running.is_empty() {
            commands.push(CoreCommand::Cancel(running));
        }
        CoreStep {
            commands,
            keep_running: false,
        }
    }

    /// Reset a failed task to pending so it is admitted again once its
    /// dependencies are satisfied.
    pub fn retry_task(&mut self, task: &str, now: DateTime<Utc>) -> Result<CoreStep> {
        self.state.reset_for_retry(task)?;
        self.dirty = true;
        info!(task = %task, "task reset for retry");

        let mut commands = vec![
            CoreCommand::Emit(LifecycleEvent::StateUpdated {
                stats: BatchStats::from_state(&self.state),
            }),
            CoreCommand::Persist,
        ];
        let keep_running = self.settle(now, &mut commands);
        Ok(CoreStep {
            commands,
            keep_running,
        })
    }

    fn update(&mut self, task: &str, update: TaskUpdate) {
        match self.state.apply(task, update) {
            Ok(()) => self.dirty = true,
            Err(e) => warn!(task = %task, error = %e, "failed to update task state"),
        }
    }

    fn add_cost(&mut self, task: &str, delta: f64, commands: &mut Vec<CoreCommand>) {
        if !delta.is_finite() {
            warn!(task = %task, delta, "ignoring non-finite cost report");
            return;
        }
        let cost = self.state.task(task).map_or(0.0, |t| t.cost) + delta;
        self.update(
            task,
            TaskUpdate {
                cost: Some(cost),
                ..TaskUpdate::default()
            },
        );
        commands.push(CoreCommand::Emit(LifecycleEvent::StateUpdated {
            stats: BatchStats::from_state(&self.state),
        }));

        let Some(budget) = self.descriptors.get(task).and_then(|d| d.budget) else {
            return;
        };
        if cost > budget && self.over_budget.insert(task.to_string()) {
            warn!(task = %task, cost, budget, "task exceeded its budget; stopping it");
            commands.push(CoreCommand::Cancel(vec![task.to_string()]));
        }
    }

    fn finish_task(
        &mut self,
        task: &str,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
        commands: &mut Vec<CoreCommand>,
    ) {
        self.running.remove(task);
        let cancelled_by_operator = self.cancelling.remove(task);
        let outcome = if self.over_budget.remove(task) {
            TaskOutcome::Failed {
                error: BUDGET_EXCEEDED.to_string(),
            }
        } else if cancelled_by_operator {
            TaskOutcome::Cancelled
        } else {
            outcome
        };

        let next = match &outcome {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
        };
        if let Err(e) = self.state.transition(task, next) {
            warn!(task = %task, error = %e, "dropping task result");
            return;
        }

        let mut update = TaskUpdate {
            completed_at: Some(Some(now)),
            current_step: Some(None),
            pending_escalation: Some(None),
            ..TaskUpdate::default()
        };
        let cost = self.state.task(task).map_or(0.0, |t| t.cost);
        let event = match outcome {
            TaskOutcome::Completed { result } => {
                info!(task = %task, cost, "task completed");
                update.result = Some(Some(result.clone()));
                update.error = Some(None);
                LifecycleEvent::TaskCompleted {
                    task: task.to_string(),
                    result,
                    cost,
                }
            }
            TaskOutcome::Failed { error } => {
                warn!(task = %task, %error, "task failed");
                update.error = Some(Some(error.clone()));
                LifecycleEvent::TaskFailed {
                    task: task.to_string(),
                    error,
                }
            }
            TaskOutcome::Cancelled => {
                info!(task = %task, "task cancelled");
                LifecycleEvent::TaskCancelled {
                    task: task.to_string(),
                }
            }
        };
        self.update(task, update);

        commands.push(CoreCommand::Emit(event));
        commands.push(CoreCommand::Emit(LifecycleEvent::StateUpdated {
            stats: BatchStats::from_state(&self.state),
        }));
        commands.push(CoreCommand::Persist);
    }

    /// Admit what fits, then decide whether the batch is over.
    fn settle(&mut self, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) -> bool {
        if self.finished {
            return false;
        }

        self.admit(now, commands);

        if !self.running.is_empty() {
            return true;
        }

        if self.state.cancel_requested {
            self.finish(BatchStatus::Cancelled, now, commands);
            return false;
        }

        // Nothing running but something admissible: only while paused.
        if !self.ready().is_empty() {
            return true;
        }

        let blocked: Vec<TaskId> = self
            .graph
            .tasks()
            .filter(|id| {
                self.state
                    .task(id)
                    .is_some_and(|t| t.status == TaskStatus::Pending)
            })
            .map(str::to_string)
            .collect();

        let status = if !blocked.is_empty() {
            warn!(
                batch_id = %self.state.batch_id,
                tasks = ?blocked,
                "deadlock: pending tasks can never become ready"
            );
            self.state.deadlocked = blocked.clone();
            commands.push(CoreCommand::Emit(LifecycleEvent::DeadlockDetected { blocked }));
            BatchStatus::Failed
        } else if self.any_with(TaskStatus::Failed) {
            BatchStatus::Failed
        } else if self.any_with(TaskStatus::Cancelled) {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };

        self.finish(status, now, commands);
        false
    }

    fn admit(&mut self, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        if self.paused || self.state.cancel_requested {
            return;
        }
        let free = self.concurrency.saturating_sub(self.running.len());
        if free == 0 {
            return;
        }

        let mut runs = Vec::new();
        for id in self.ready().into_iter().take(free) {
            let Some(descriptor) = self.descriptors.get(&id).cloned() else {
                warn!(task = %id, "no descriptor for ready task");
                continue;
            };
            let previous: TaskRuntimeState = self.state.task(&id).cloned().unwrap_or_default();
            if let Err(e) = self.state.transition(&id, TaskStatus::Running) {
                warn!(task = %id, error = %e, "cannot admit task");
                continue;
            }

            let attempt = previous.attempts + 1;
            self.update(
                &id,
                TaskUpdate {
                    started_at: Some(Some(now)),
                    completed_at: Some(None),
                    attempts: Some(attempt),
                    error: Some(None),
                    current_step: Some(None),
                    // Left over from a session that is gone.
                    pending_escalation: Some(None),
                    ..TaskUpdate::default()
                },
            );
            self.running.insert(id.clone(), attempt);

            let resume_token = previous.session_token;
            info!(
                task = %id,
                attempt,
                resumed_session = resume_token.is_some(),
                "task admitted"
            );
            commands.push(CoreCommand::Emit(LifecycleEvent::TaskStarted {
                task: id.clone(),
                attempt,
                resumed_session: resume_token.is_some(),
            }));
            runs.push(TaskRun {
                descriptor,
                resume_token,
                attempt,
            });
        }

        if !runs.is_empty() {
            commands.push(CoreCommand::Dispatch(runs));
            commands.push(CoreCommand::Emit(LifecycleEvent::StateUpdated {
                stats: BatchStats::from_state(&self.state),
            }));
        }
    }

    fn finish(&mut self, status: BatchStatus, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        self.finished = true;
        self.dirty = true;
        self.state.status = status;
        self.state.completed_at = Some(now);

        let stats = BatchStats::from_state(&self.state);
        info!(
            batch_id = %self.state.batch_id,
            %status,
            %stats,
            "batch finished"
        );
        commands.push(CoreCommand::Emit(LifecycleEvent::BatchCompleted {
            batch_id: self.state.batch_id.clone(),
            status,
            stats,
        }));
        commands.push(CoreCommand::Persist);
    }

    fn any_with(&self, status: TaskStatus) -> bool {
        self.state.tasks.values().any(|t| t.status == status)
    }
}

/// Line a (possibly reloaded) state up with the current task list.
///
/// Tasks new to the list get fresh `pending` entries. A recorded task that
/// is no longer in the list is a [`BatchdagError::ConfigError`].
pub fn reconcile_tasks(state: &mut BatchState, graph: &DagGraph) -> Result<()> {
    let unknown: Vec<&str> = state
        .tasks
        .keys()
        .map(String::as_str)
        .filter(|id| !graph.contains(id))
        .collect();
    if !unknown.is_empty() {
        return Err(BatchdagError::ConfigError(format!(
            "batch '{}' records tasks missing from the task list: {}",
            state.batch_id,
            unknown.join(", ")
        )));
    }

    for id in graph.tasks() {
        if !state.tasks.contains_key(id) {
            info!(task = %id, "task added since the batch was saved; starting it as pending");
            state.tasks.insert(id.to_string(), TaskRuntimeState::default());
        }
    }
    state.recompute_total_cost();
    Ok(())
}
