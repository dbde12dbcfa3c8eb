use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use batchdag::errors::ExecutionError;
use batchdag::escalation::{EscalationRequest, EscalationResponse};
use batchdag::exec::{ExecFuture, ExecutionContext, Executor, TaskRun};
use batchdag::types::TaskId;
use tokio::sync::Notify;

/// One scripted action of a task.
#[derive(Debug, Clone)]
pub enum Step {
    /// Finish with this result.
    Succeed(String),
    /// Finish with this error.
    Fail(String),
    /// Wait until [`ScriptedExecutor::release`] is called (or cancelled).
    Block,
    /// Raise an escalation and record the response.
    Escalate(EscalationRequest),
    Cost(f64),
    Progress(String),
    Tool(String),
    Session(String),
    Panic,
}

/// One recorded start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRecord {
    pub task: TaskId,
    pub attempt: u32,
    pub resume_token: Option<String>,
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    gates: Mutex<HashMap<TaskId, Arc<Notify>>>,
    starts: Mutex<Vec<StartRecord>>,
    responses: Mutex<Vec<(TaskId, EscalationResponse)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// A fake executor that:
/// - plays a per-task script of [`Step`]s, shared across attempts
/// - succeeds with `"<id> done"` once a task's script is exhausted
/// - records start order, resume tokens and escalation responses
/// - tracks how many tasks ran at the same time.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    inner: Arc<Inner>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append steps to `task`'s script.
    pub fn script(self, task: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .extend(steps);
        self
    }

    /// Let one `Step::Block` of `task` proceed. A release that arrives
    /// before the task blocks is remembered.
    pub fn release(&self, task: &str) {
        self.gate(task).notify_one();
    }

    /// Task ids in the order they were started.
    pub fn started(&self) -> Vec<TaskId> {
        self.starts().into_iter().map(|s| s.task).collect()
    }

    pub fn starts(&self) -> Vec<StartRecord> {
        self.inner.starts.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<(TaskId, EscalationResponse)> {
        self.inner.responses.lock().unwrap().clone()
    }

    pub fn running_now(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Highest number of tasks that ran at once.
    pub fn peak_running(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    fn gate(&self, task: &str) -> Arc<Notify> {
        let mut gates = self.inner.gates.lock().unwrap();
        Arc::clone(gates.entry(task.to_string()).or_default())
    }

    fn next_step(&self, task: &str) -> Option<Step> {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(task)
            .and_then(|steps| steps.pop_front())
    }

    async fn play(&self, task: &str, ctx: &ExecutionContext) -> Result<String, ExecutionError> {
        loop {
            if ctx.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let Some(step) = self.next_step(task) else {
                return Ok(format!("{task} done"));
            };
            match step {
                Step::Succeed(result) => return Ok(result),
                Step::Fail(error) => return Err(ExecutionError::Failed(error)),
                Step::Panic => panic!("scripted panic in task {task}"),
                Step::Cost(delta) => ctx.report_cost(delta).await,
                Step::Progress(step) => ctx.progress(step).await,
                Step::Tool(tool) => ctx.tool_use(tool).await,
                Step::Session(token) => ctx.session_started(token).await,
                Step::Escalate(request) => {
                    let response = ctx
                        .escalate(request)
                        .await
                        .map_err(|e| ExecutionError::Failed(e.to_string()))?;
                    self.inner
                        .responses
                        .lock()
                        .unwrap()
                        .push((task.to_string(), response));
                }
                Step::Block => {
                    let gate = self.gate(task);
                    tokio::select! {
                        _ = gate.notified() => {}
                        _ = ctx.cancel_signal().cancelled() => return Err(ExecutionError::Cancelled),
                    }
                }
            }
        }
    }
}

/// Decrements the running counter when an attempt ends, panics included.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run<'a>(&'a self, run: TaskRun, ctx: ExecutionContext) -> ExecFuture<'a> {
        Box::pin(async move {
            let task = run.id().to_string();
            self.inner.starts.lock().unwrap().push(StartRecord {
                task: task.clone(),
                attempt: run.attempt,
                resume_token: run.resume_token.clone(),
            });

            let now = self.inner.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard(&self.inner.running);

            self.play(&task, &ctx).await
        })
    }
}
