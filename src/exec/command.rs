// src/exec/command.rs

//! Shell-command executor.
//!
//! Runs `payload.cmd` through the platform shell inside the task's context
//! directory. The child talks back through directive lines on stdout:
//!
//! ```text
//! @@progress <text>      current step
//! @@tool <name>          tool being used
//! @@cost <decimal>       cost increment
//! @@session <token>      resumable session token
//! @@result <text>        task result (otherwise the last plain stdout line)
//! @@escalate <json>      ask the operator; the answer arrives on stdin as one JSON line
//! ```

use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ExecutionError;
use crate::escalation::EscalationRequest;
use crate::exec::backend::{ExecFuture, ExecutionContext, Executor, TaskRun};

static DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@(\w+)\s*(.*)$").expect("directive pattern is valid"));

/// Executor that runs a shell command per task.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    fn run<'a>(&'a self, run: TaskRun, ctx: ExecutionContext) -> ExecFuture<'a> {
        Box::pin(run_shell(run, ctx))
    }
}

/// Output gathered while the child runs.
#[derive(Debug, Default)]
struct Captured {
    result: Option<String>,
    last_plain: Option<String>,
}

async fn run_shell(run: TaskRun, ctx: ExecutionContext) -> Result<String, ExecutionError> {
    let task_id = run.id().to_string();
    let cmd_text = run
        .descriptor
        .payload
        .get("cmd")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ExecutionError::Failed(format!("task '{task_id}' has no `cmd` in its payload"))
        })?
        .to_string();

    let session = run
        .resume_token
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ctx.session_started(session.clone()).await;

    info!(
        task = %task_id,
        attempt = run.attempt,
        cmd = %cmd_text,
        resumed = run.resume_token.is_some(),
        "starting task process"
    );

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&cmd_text);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&cmd_text);
        c
    };

    cmd.current_dir(&run.descriptor.context)
        .env("BATCHDAG_TASK_ID", &task_id)
        .env("BATCHDAG_SESSION", &session)
        .env("BATCHDAG_ATTEMPT", run.attempt.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(budget) = run.descriptor.budget {
        cmd.env("BATCHDAG_BUDGET", budget.to_string());
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecutionError::Failed(format!("spawning '{cmd_text}': {e}")))?;

    let mut stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutionError::Failed("child has no stdout pipe".to_string()))?;

    // Always drain stderr so the pipe never fills; keep the last line for
    // the failure message.
    let stderr_tail = child.stderr.take().map(|stderr| {
        let task = task_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last = None;
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %task, "stderr: {}", line);
                if !line.trim().is_empty() {
                    last = Some(line);
                }
            }
            last
        })
    });

    let cancel = ctx.cancel_signal().clone();
    let mut lines = BufReader::new(stdout).lines();
    let mut captured = Captured::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(kill_cancelled(&task_id, &mut child).await);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&line, &ctx, &mut stdin, &mut captured).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(task = %task_id, error = %e, "failed to read task stdout");
                    break;
                }
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(kill_cancelled(&task_id, &mut child).await);
        }
        status = child.wait() => status
            .map_err(|e| ExecutionError::Failed(format!("waiting for '{cmd_text}': {e}")))?,
    };

    let last_stderr = match stderr_tail {
        Some(handle) => handle.await.ok().flatten(),
        None => None,
    };

    let code = status.code().unwrap_or(-1);
    info!(
        task = %task_id,
        attempt = run.attempt,
        exit_code = code,
        success = status.success(),
        "task process exited"
    );

    if !status.success() {
        let message = match last_stderr {
            Some(line) => format!("exit code {code}: {line}"),
            None => format!("exit code {code}"),
        };
        return Err(ExecutionError::Failed(message));
    }

    Ok(captured
        .result
        .or(captured.last_plain)
        .unwrap_or_default())
}

async fn kill_cancelled(task_id: &str, child: &mut Child) -> ExecutionError {
    info!(task = %task_id, "cancellation requested; killing process");
    if let Err(e) = child.kill().await {
        warn!(task = %task_id, error = %e, "failed to kill child process on cancellation");
    }
    ExecutionError::Cancelled
}

async fn handle_line(
    line: &str,
    ctx: &ExecutionContext,
    stdin: &mut Option<ChildStdin>,
    captured: &mut Captured,
) {
    let Some(caps) = DIRECTIVE.captures(line) else {
        debug!(task = %ctx.task_id(), "stdout: {}", line);
        if !line.trim().is_empty() {
            captured.last_plain = Some(line.to_string());
        }
        return;
    };

    let body = caps.get(2).map_or("", |m| m.as_str()).trim();
    match &caps[1] {
        "progress" => ctx.progress(body).await,
        "tool" => ctx.tool_use(body).await,
        "session" => ctx.session_started(body).await,
        "result" => captured.result = Some(body.to_string()),
        "cost" => match body.parse::<f64>() {
            Ok(delta) if delta.is_finite() => ctx.report_cost(delta).await,
            _ => warn!(task = %ctx.task_id(), value = %body, "ignoring malformed @@cost"),
        },
        "escalate" => escalate(body, ctx, stdin).await,
        other => debug!(task = %ctx.task_id(), directive = %other, "unknown directive"),
    }
}

async fn escalate(body: &str, ctx: &ExecutionContext, stdin: &mut Option<ChildStdin>) {
    let request: EscalationRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(task = %ctx.task_id(), error = %e, "ignoring malformed @@escalate");
            return;
        }
    };

    let response = match ctx.escalate(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(task = %ctx.task_id(), error = %e, "escalation rejected");
            return;
        }
    };

    let Some(pipe) = stdin.as_mut() else {
        warn!(task = %ctx.task_id(), "no stdin pipe to deliver escalation response");
        return;
    };
    let mut line = match serde_json::to_string(&response) {
        Ok(line) => line,
        Err(e) => {
            warn!(task = %ctx.task_id(), error = %e, "failed to encode escalation response");
            return;
        }
    };
    line.push('\n');
    if let Err(e) = pipe.write_all(line.as_bytes()).await {
        warn!(task = %ctx.task_id(), error = %e, "failed to write escalation response");
        return;
    }
    let _ = pipe.flush().await;
}
