// tests/shell_executor.rs
#![cfg(unix)]

use std::time::Duration;

use batchdag::engine::RuntimeEvent;
use batchdag::errors::ExecutionError;
use batchdag::escalation::{EscalationCoordinator, EscalationResponse};
use batchdag::exec::{
    CancelHandle, ExecutionContext, Executor, ResumeFallback, ShellExecutor, TaskRun, cancel_pair,
};
use batchdag::types::TaskDescriptor;
use batchdag_test_utils::{DescriptorBuilder, init_tracing, with_timeout};
use tokio::sync::mpsc;

struct Fixture {
    ctx: ExecutionContext,
    events: mpsc::Receiver<RuntimeEvent>,
    escalations: EscalationCoordinator,
    cancel: CancelHandle,
}

fn fixture() -> Fixture {
    init_tracing();
    let (tx, events) = mpsc::channel(64);
    let escalations = EscalationCoordinator::new();
    let (cancel, signal) = cancel_pair();
    let ctx = ExecutionContext::new("T", 1, tx, escalations.clone(), signal);
    Fixture {
        ctx,
        events,
        escalations,
        cancel,
    }
}

fn run_of(descriptor: TaskDescriptor, resume_token: Option<&str>) -> TaskRun {
    TaskRun {
        descriptor,
        resume_token: resume_token.map(str::to_string),
        attempt: 1,
    }
}

fn shell(cmd: &str) -> TaskRun {
    run_of(DescriptorBuilder::new("T").cmd(cmd).build(), None)
}

fn drain(events: &mut mpsc::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn directives_become_task_events() {
    let mut f = fixture();
    let cmd = "echo '@@progress step one'; echo '@@tool grep'; echo '@@cost 0.5'; \
               echo '@@cost nonsense'; echo '@@result final answer'; echo plain";

    let result = with_timeout(ShellExecutor::new().run(shell(cmd), f.ctx.clone())).await;
    assert_eq!(result, Ok("final answer".to_string()));

    let events = drain(&mut f.events);
    assert!(matches!(events[0], RuntimeEvent::SessionStarted { .. }));
    assert!(events.iter().any(
        |e| matches!(e, RuntimeEvent::TaskProgressed { step, .. } if step == "step one")
    ));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, RuntimeEvent::ToolUsed { tool, .. } if tool == "grep"))
    );
    let costs: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::CostReported { delta, .. } => Some(*delta),
            _ => None,
        })
        .collect();
    assert_eq!(costs, vec![0.5]);
}

#[tokio::test]
async fn last_plain_line_is_the_default_result() {
    let f = fixture();
    let result = with_timeout(ShellExecutor::new().run(shell("echo one; echo two; echo"), f.ctx)).await;
    assert_eq!(result, Ok("two".to_string()));
}

#[tokio::test]
async fn non_zero_exit_fails_with_the_last_stderr_line() {
    let f = fixture();
    let result =
        with_timeout(ShellExecutor::new().run(shell("echo oops >&2; exit 3"), f.ctx)).await;
    assert_eq!(
        result,
        Err(ExecutionError::Failed("exit code 3: oops".to_string()))
    );
}

#[tokio::test]
async fn missing_cmd_fails_without_spawning() {
    let f = fixture();
    let run = run_of(TaskDescriptor::new("T"), None);
    match with_timeout(ShellExecutor::new().run(run, f.ctx)).await {
        Err(ExecutionError::Failed(msg)) => assert!(msg.contains("cmd")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn environment_and_context_are_set() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let descriptor = DescriptorBuilder::new("T")
        .cmd("echo \"$BATCHDAG_TASK_ID:$BATCHDAG_SESSION:$BATCHDAG_BUDGET:$(basename \"$(pwd -P)\")\"")
        .budget(2.5)
        .context(dir.path())
        .build();
    let dir_name = dir.path().file_name().unwrap().to_str().unwrap().to_string();

    let result = with_timeout(
        ShellExecutor::new().run(run_of(descriptor, Some("tok-1")), f.ctx),
    )
    .await;
    assert_eq!(result, Ok(format!("T:tok-1:2.5:{dir_name}")));
}

#[tokio::test]
async fn cancellation_kills_the_process() {
    let f = fixture();
    let exec = ShellExecutor::new();
    let running = exec.run(shell("echo started; sleep 30"), f.ctx);

    let cancel = f.cancel;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    assert_eq!(with_timeout(running).await, Err(ExecutionError::Cancelled));
}

#[tokio::test]
async fn escalation_answer_is_written_to_stdin() {
    let mut f = fixture();
    let cmd = r#"echo '@@escalate {"question":"pick","choices":["a","b"]}'; read answer; echo "$answer""#;

    let escalations = f.escalations.clone();
    tokio::spawn(async move {
        loop {
            if escalations.pending("T").is_some() {
                let _ = escalations.resolve("T", EscalationResponse::Choice("b".into()));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let result = with_timeout(ShellExecutor::new().run(shell(cmd), f.ctx.clone())).await;
    assert_eq!(result, Ok(r#"{"kind":"choice","value":"b"}"#.to_string()));

    let events = drain(&mut f.events);
    assert!(events.iter().any(|e| matches!(
        e,
        RuntimeEvent::EscalationRaised { request, .. }
            if request.task_id == "T" && request.choices == vec!["a", "b"]
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RuntimeEvent::EscalationSettled { response: EscalationResponse::Choice(c), .. } if c == "b"
    )));
}

#[tokio::test]
async fn failed_resume_falls_back_to_a_fresh_session() {
    let mut f = fixture();
    let descriptor = DescriptorBuilder::new("T")
        .cmd("[ \"$BATCHDAG_SESSION\" != stale ] || exit 1; echo fresh")
        .build();

    let exec = ResumeFallback::new(ShellExecutor::new());
    let result = with_timeout(exec.run(run_of(descriptor, Some("stale")), f.ctx.clone())).await;
    assert_eq!(result, Ok("fresh".to_string()));

    let tokens: Vec<String> = drain(&mut f.events)
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::SessionStarted { token, .. } => Some(token),
            _ => None,
        })
        .collect();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0], "stale");
    assert_ne!(tokens[1], "stale");
}
