// src/console.rs

//! Operator console: line commands typed on stdin while a batch runs, and
//! the one-line rendering of lifecycle events.
//!
//! ```text
//! pause | resume | cancel <id> | cancel-all | retry <id>
//! answer <id> <text>   (a number selects the n-th offered choice)
//! decide <id> | skip <id> | status | help
//! ```

use std::fmt::Write as _;
use std::io::BufRead;
use std::path::Path;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{LifecycleEvent, SchedulerHandle};
use crate::errors::Result;
use crate::escalation::{EscalationRequest, EscalationResponse};
use crate::state::{BatchState, BatchStatus, TaskStatus};
use crate::types::TaskId;

pub const HELP: &str = "commands: pause | resume | cancel <id> | cancel-all | retry <id> | \
answer <id> <text> | decide <id> | skip <id> | status | help";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Pause,
    Resume,
    Cancel(TaskId),
    CancelAll,
    Retry(TaskId),
    Answer { task: TaskId, text: String },
    Decide(TaskId),
    Skip(TaskId),
    Status,
    Help,
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_operator_command(line: &str) -> std::result::Result<Option<OperatorCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let task_arg = |name: &str| -> std::result::Result<TaskId, String> {
        match rest.split_whitespace().next() {
            Some(id) => Ok(id.to_string()),
            None => Err(format!("usage: {name} <task-id>")),
        }
    };

    let command = match verb.to_lowercase().as_str() {
        "pause" => OperatorCommand::Pause,
        "resume" => OperatorCommand::Resume,
        "cancel-all" => OperatorCommand::CancelAll,
        "cancel" => OperatorCommand::Cancel(task_arg("cancel")?),
        "retry" => OperatorCommand::Retry(task_arg("retry")?),
        "decide" => OperatorCommand::Decide(task_arg("decide")?),
        "skip" => OperatorCommand::Skip(task_arg("skip")?),
        "status" => OperatorCommand::Status,
        "help" | "?" => OperatorCommand::Help,
        "answer" => {
            let (task, text) = rest
                .split_once(char::is_whitespace)
                .map(|(task, text)| (task, text.trim()))
                .filter(|(_, text)| !text.is_empty())
                .ok_or_else(|| "usage: answer <task-id> <text>".to_string())?;
            OperatorCommand::Answer {
                task: task.to_string(),
                text: text.to_string(),
            }
        }
        other => return Err(format!("unknown command '{other}'; {HELP}")),
    };

    Ok(Some(command))
}

/// Turn an operator's free-form answer into a response.
///
/// A number between 1 and the number of offered choices selects that
/// choice, as does the exact text of a choice. Anything else is free text.
pub fn answer_to_response(text: &str, request: Option<&EscalationRequest>) -> EscalationResponse {
    let text = text.trim();
    if let Some(request) = request {
        if let Ok(n) = text.parse::<usize>() {
            if n >= 1 && n <= request.choices.len() {
                return EscalationResponse::Choice(request.choices[n - 1].clone());
            }
        }
        if let Some(choice) = request.choices.iter().find(|c| c.as_str() == text) {
            return EscalationResponse::Choice(choice.clone());
        }
    }
    EscalationResponse::FreeText(text.to_string())
}

/// Carry out one console command against a running batch. Returns the
/// line to show the operator.
pub async fn apply_operator_command(
    handle: &SchedulerHandle,
    command: OperatorCommand,
) -> Result<String> {
    let message = match command {
        OperatorCommand::Pause => {
            handle.pause()?;
            "pausing admission".to_string()
        }
        OperatorCommand::Resume => {
            handle.resume()?;
            "resuming admission".to_string()
        }
        OperatorCommand::CancelAll => {
            handle.cancel_all()?;
            "cancelling batch".to_string()
        }
        OperatorCommand::Cancel(task) => {
            if handle.cancel_task(&task).await? {
                format!("cancelling {task}")
            } else {
                format!("{task} is not running")
            }
        }
        OperatorCommand::Retry(task) => {
            handle.retry_task(&task).await?;
            format!("{task} queued for retry")
        }
        OperatorCommand::Answer { task, text } => {
            let request = handle
                .pending_escalations()
                .into_iter()
                .find(|r| r.task_id == task);
            let response = answer_to_response(&text, request.as_ref());
            handle.resolve_escalation(&task, response.clone())?;
            format!("{task}: {response}")
        }
        OperatorCommand::Decide(task) => {
            handle.resolve_escalation(&task, EscalationResponse::AgentDecide)?;
            format!("{task}: letting the task decide")
        }
        OperatorCommand::Skip(task) => {
            handle.resolve_escalation(&task, EscalationResponse::Skip)?;
            format!("{task}: skipped")
        }
        OperatorCommand::Status => render_status(handle),
        OperatorCommand::Help => HELP.to_string(),
    };
    Ok(message)
}

fn render_status(handle: &SchedulerHandle) -> String {
    let state = handle.snapshot();
    let mut out = format!("{} [{}] {}", state.name, state.status, handle.stats());
    for (id, task) in &state.tasks {
        let _ = write!(out, "\n  {id}: {}", task.status);
        if let Some(step) = &task.current_step {
            let _ = write!(out, " ({step})");
        }
    }
    for request in handle.pending_escalations() {
        let _ = write!(out, "\n  ? {}: {}", request.task_id, request.question);
    }
    out
}

/// Read operator commands from stdin until EOF or the batch ends.
///
/// Stdin is read on a plain thread so a pending read never holds up runtime
/// shutdown.
pub fn spawn_console(handle: SchedulerHandle) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to read operator input");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let command = match parse_operator_command(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(message) => {
                    eprintln!("{message}");
                    continue;
                }
            };

            match apply_operator_command(&handle, command).await {
                Ok(message) => println!("{message}"),
                Err(e) => eprintln!("{e}"),
            }
        }
        debug!("operator console closed");
    })
}

/// The `batchdag resume` invocation that can make progress on `state`, if
/// any.
///
/// An unfinished (interrupted) batch resumes as is. A failed batch only
/// moves again once its failed tasks are retried. Completed and cancelled
/// batches have nothing left to run.
pub fn resume_hint(state: &BatchState, state_dir: &Path) -> Option<String> {
    let command = format!(
        "batchdag resume --batch {} --state-dir {}",
        state.batch_id,
        state_dir.display()
    );
    match state.status {
        BatchStatus::Pending | BatchStatus::Running => Some(command),
        BatchStatus::Failed if !state.ids_with_status(TaskStatus::Failed).is_empty() => {
            Some(format!("{command} --retry-failed"))
        }
        _ => None,
    }
}

/// One line describing `event`.
pub fn render_event(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::BatchStarted {
            batch_id,
            name,
            total_tasks,
            resumed,
        } => {
            let verb = if *resumed { "resumed" } else { "started" };
            format!("batch {name} ({batch_id}) {verb}: {total_tasks} tasks")
        }
        LifecycleEvent::BatchPaused => "batch paused".to_string(),
        LifecycleEvent::BatchResumed => "batch resumed".to_string(),
        LifecycleEvent::TaskStarted {
            task,
            attempt,
            resumed_session,
        } => {
            let mut line = format!("▶ {task} started (attempt {attempt})");
            if *resumed_session {
                line.push_str(", resuming session");
            }
            line
        }
        LifecycleEvent::TaskProgress { task, step } => format!("  {task}: {step}"),
        LifecycleEvent::TaskToolUse { task, tool } => format!("  {task} uses {tool}"),
        LifecycleEvent::TaskCompleted { task, result, cost } => {
            if result.is_empty() {
                format!("✔ {task} completed (cost {cost:.4})")
            } else {
                format!("✔ {task} completed (cost {cost:.4}): {result}")
            }
        }
        LifecycleEvent::TaskFailed { task, error } => format!("✘ {task} failed: {error}"),
        LifecycleEvent::TaskCancelled { task } => format!("■ {task} cancelled"),
        LifecycleEvent::EscalationRaised { request } => {
            let mut line = format!("? {} asks: {}", request.task_id, request.question);
            for (i, choice) in request.choices.iter().enumerate() {
                let _ = write!(line, "\n    {}. {choice}", i + 1);
            }
            line
        }
        LifecycleEvent::EscalationResolved { task, response } => {
            format!("  {task} escalation answered: {response}")
        }
        LifecycleEvent::DeadlockDetected { blocked } => {
            format!("deadlock: {} can never start", blocked.join(", "))
        }
        LifecycleEvent::StateUpdated { stats } => format!("  {stats}"),
        LifecycleEvent::BatchInterrupted { batch_id, running } => {
            if running.is_empty() {
                format!("batch {batch_id} interrupted")
            } else {
                format!(
                    "batch {batch_id} interrupted; {} will resume",
                    running.join(", ")
                )
            }
        }
        LifecycleEvent::BatchCompleted {
            batch_id,
            status,
            stats,
        } => format!("batch {batch_id} {status}: {stats}"),
    }
}
