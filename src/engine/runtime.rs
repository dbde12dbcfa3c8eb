// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dag::DagGraph;
use crate::errors::{BatchdagError, Result};
use crate::escalation::{EscalationCoordinator, EscalationResponse};
use crate::exec::{CancelHandle, ExecutionContext, Executor, TaskRun, cancel_pair};
use crate::fs::{FileSystem, RealFileSystem};
use crate::state::{BatchState, SourceRef, StateStore, create_initial, prepare_resume};
use crate::types::{TaskDescriptor, TaskId};

use super::core::{BatchCore, CoreCommand, CoreStep, reconcile_tasks};
use super::handle::SchedulerHandle;
use super::{ControlCommand, LifecycleEvent, RuntimeEvent, TaskOutcome};

/// Capacity of the executor -> control loop event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables of one scheduler run.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Maximum number of tasks running at once (>= 1).
    pub concurrency: usize,
    /// How often unsaved progress is flushed to the store.
    pub autosave_interval: Duration,
    /// Auto-resolve unanswered escalations with "let the task decide".
    pub escalation_timeout: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            autosave_interval: Duration::from_secs(5),
            escalation_timeout: None,
        }
    }
}

/// Where the batch state comes from.
#[derive(Debug, Clone)]
pub enum BatchInit {
    /// New batch with a fresh id; every task starts `pending`.
    Fresh { name: String, source: SourceRef },
    /// State reloaded from the store.
    Resume(BatchState),
}

/// Drives a batch to a terminal status.
///
/// This is the IO shell around [`BatchCore`], which holds all scheduling
/// semantics. The shell owns the channels, spawns one executor future per
/// admitted task, persists through the [`StateStore`] and publishes every
/// new state to the [`SchedulerHandle`]s.
pub struct Scheduler<F: FileSystem = RealFileSystem> {
    core: BatchCore,
    resumed: bool,
    executor: Arc<dyn Executor>,
    store: StateStore<F>,
    options: SchedulerOptions,
    escalations: EscalationCoordinator,
    event_tx: mpsc::Sender<RuntimeEvent>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    snapshot_tx: watch::Sender<BatchState>,
    /// Cancel handles of running attempts, keyed by task.
    cancel_handles: HashMap<TaskId, (u32, CancelHandle)>,
}

impl<F: FileSystem> fmt::Debug for Scheduler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("core", &self.core)
            .field("executor", &self.executor.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<F: FileSystem> Scheduler<F> {
    /// Validate the task graph and prepare a run.
    ///
    /// Graph errors (duplicate ids, unknown dependencies, cycles) are
    /// returned here, before anything starts. Also returns the operator
    /// handle and the receiver of lifecycle events.
    pub fn new(
        descriptors: Vec<TaskDescriptor>,
        init: BatchInit,
        executor: Arc<dyn Executor>,
        store: StateStore<F>,
        options: SchedulerOptions,
    ) -> Result<(Self, SchedulerHandle, mpsc::UnboundedReceiver<LifecycleEvent>)> {
        if options.concurrency == 0 {
            return Err(BatchdagError::ConfigError(
                "concurrency must be >= 1 (got 0)".to_string(),
            ));
        }

        let graph = DagGraph::validated(&descriptors)?;

        let (state, resumed) = match init {
            BatchInit::Fresh { name, source } => {
                let ids = graph.tasks().map(str::to_string);
                (create_initial(Uuid::new_v4().to_string(), name, source, ids), false)
            }
            BatchInit::Resume(mut state) => {
                prepare_resume(&mut state);
                reconcile_tasks(&mut state, &graph)?;
                (state, true)
            }
        };

        let core = BatchCore::new(graph, descriptors, state, options.concurrency);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(core.state().clone());
        let escalations = EscalationCoordinator::new();

        let handle = SchedulerHandle::new(control_tx, snapshot_rx, escalations.clone());

        let scheduler = Self {
            core,
            resumed,
            executor,
            store,
            options,
            escalations,
            event_tx,
            event_rx,
            control_rx,
            lifecycle_tx,
            snapshot_tx,
            cancel_handles: HashMap::new(),
        };

        Ok((scheduler, handle, lifecycle_rx))
    }

    pub fn batch_id(&self) -> &str {
        &self.core.state().batch_id
    }

    /// Run the batch to a terminal status and return the final state.
    ///
    /// Task failures never surface here; they are recorded in the state.
    /// A failure to persist the state is fatal: every running task is
    /// cancelled and the error is returned.
    pub async fn run(mut self) -> Result<BatchState> {
        let outcome = self.drive().await;
        if let Err(err) = &outcome {
            error!(
                batch_id = %self.core.state().batch_id,
                error = %err,
                "batch aborted; cancelling running tasks"
            );
            self.abort_running();
        }
        outcome
    }

    async fn drive(&mut self) -> Result<BatchState> {
        info!(batch_id = %self.core.state().batch_id, "scheduler control loop started");

        let mut autosave = tokio::time::interval(self.options.autosave_interval);
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        autosave.tick().await;

        let step = self.core.begin(Utc::now(), self.resumed);
        let mut keep_running = self.execute(step)?;

        while keep_running {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    debug!(?event, "control loop received event");
                    self.forget_finished(&event);
                    let step = self.core.handle_event(event, Utc::now());
                    keep_running = self.execute(step)?;
                }
                Some(command) = self.control_rx.recv() => {
                    debug!(?command, "control loop received command");
                    keep_running = self.handle_control(command)?;
                }
                _ = autosave.tick() => {
                    if self.core.take_dirty() {
                        self.persist()?;
                    }
                }
            }
        }

        info!(batch_id = %self.core.state().batch_id, "scheduler control loop exiting");
        Ok(self.core.state().clone())
    }

    fn handle_control(&mut self, command: ControlCommand) -> Result<bool> {
        let now = Utc::now();
        match command {
            ControlCommand::Pause => {
                let step = self.core.pause();
                self.execute(step)
            }
            ControlCommand::Resume => {
                let step = self.core.resume(now);
                self.execute(step)
            }
            ControlCommand::CancelAll => {
                let step = self.core.cancel_all(now);
                self.execute(step)
            }
            ControlCommand::Interrupt => {
                let step = self.core.interrupt();
                self.execute(step)
            }
            ControlCommand::CancelTask { task, reply } => {
                match self.core.cancel_task(&task) {
                    Ok((signalled, step)) => {
                        let keep_running = self.execute(step)?;
                        reply_to(reply, Ok(signalled));
                        Ok(keep_running)
                    }
                    Err(e) => {
                        reply_to(reply, Err(e));
                        Ok(!self.core.is_finished())
                    }
                }
            }
            ControlCommand::RetryTask { task, reply } => match self.core.retry_task(&task, now) {
                Ok(step) => {
                    let keep_running = self.execute(step)?;
                    reply_to(reply, Ok(()));
                    Ok(keep_running)
                }
                Err(e) => {
                    warn!(task = %task, error = %e, "retry rejected");
                    reply_to(reply, Err(e));
                    Ok(!self.core.is_finished())
                }
            },
        }
    }

    /// Execute the commands of one core step and publish the new state.
    fn execute(&mut self, step: CoreStep) -> Result<bool> {
        for command in step.commands {
            match command {
                CoreCommand::Dispatch(runs) => {
                    for run in runs {
                        self.spawn_task(run);
                    }
                }
                CoreCommand::Cancel(tasks) => {
                    for task in tasks {
                        if let Some((_, handle)) = self.cancel_handles.get(&task) {
                            handle.cancel();
                        }
                        self.escalations.cancel(&task);
                    }
                }
                CoreCommand::Emit(event) => {
                    // Nobody listening is fine.
                    let _ = self.lifecycle_tx.send(event);
                }
                CoreCommand::Persist => self.persist()?,
                CoreCommand::ScheduleEscalationExpiry { task, ticket } => {
                    self.schedule_expiry(task, ticket);
                }
            }
        }

        self.snapshot_tx.send_replace(self.core.state().clone());
        Ok(step.keep_running)
    }

    fn persist(&mut self) -> Result<()> {
        self.store.save(self.core.state())?;
        self.core.take_dirty();
        Ok(())
    }

    fn spawn_task(&mut self, run: TaskRun) {
        let task = run.id().to_string();
        let attempt = run.attempt;

        let (cancel_handle, cancel_signal) = cancel_pair();
        self.cancel_handles
            .insert(task.clone(), (attempt, cancel_handle));

        let ctx = ExecutionContext::new(
            task.clone(),
            attempt,
            self.event_tx.clone(),
            self.escalations.clone(),
            cancel_signal,
        );
        let executor = Arc::clone(&self.executor);
        let events = self.event_tx.clone();

        debug!(task = %task, attempt, executor = executor.name(), "spawning executor");

        tokio::spawn(async move {
            // Run in a nested task so a panicking executor becomes a failure.
            let inner = tokio::spawn(async move { executor.run(run, ctx).await });
            let outcome = match inner.await {
                Ok(result) => TaskOutcome::from(result),
                Err(join_err) => TaskOutcome::Failed {
                    error: format!("executor panicked: {join_err}"),
                },
            };
            if events
                .send(RuntimeEvent::TaskFinished {
                    task: task.clone(),
                    attempt,
                    outcome,
                })
                .await
                .is_err()
            {
                debug!(task = %task, "control loop gone before task finished");
            }
        });
    }

    fn forget_finished(&mut self, event: &RuntimeEvent) {
        if let RuntimeEvent::TaskFinished { task, attempt, .. } = event {
            let current = self.cancel_handles.get(task).map(|(a, _)| *a);
            if current == Some(*attempt) {
                self.cancel_handles.remove(task);
            }
        }
    }

    fn schedule_expiry(&self, task: TaskId, ticket: u64) {
        let Some(timeout) = self.options.escalation_timeout else {
            return;
        };
        let escalations = self.escalations.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if escalations
                .resolve_ticket(&task, ticket, EscalationResponse::AgentDecide)
                .is_ok()
            {
                info!(task = %task, ticket, "escalation timed out; letting the task decide");
            }
        });
    }

    fn abort_running(&mut self) {
        for (task, (_, handle)) in self.cancel_handles.drain() {
            handle.cancel();
            self.escalations.cancel(&task);
        }
    }
}

fn reply_to<T>(reply: oneshot::Sender<Result<T>>, value: Result<T>) {
    if reply.send(value).is_err() {
        debug!("operator stopped waiting for a reply");
    }
}
