// src/lib.rs

pub mod cli;
pub mod config;
pub mod console;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod escalation;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod state;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::{LoadedBatch, load_and_validate, parse_batch_file, reload_task_list};
use crate::console::{render_event, resume_hint, spawn_console};
use crate::dag::DagGraph;
use crate::engine::{BatchInit, Scheduler, SchedulerOptions};
use crate::exec::{Executor, ResumeFallback, ShellExecutor};
use crate::fs::{FileSystem, RealFileSystem};
use crate::state::{BatchStatus, StateStore, TaskStatus, derive_stats};
use crate::types::TaskDescriptor;

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Run {
            tasks,
            concurrency,
            state_dir,
            dry_run,
        } => run_batch(&tasks, concurrency, state_dir, dry_run).await,
        Command::Resume {
            batch,
            state_dir,
            concurrency,
            retry_failed,
        } => resume_batch(&batch, state_dir, concurrency, retry_failed).await,
        Command::Status { batch, state_dir } => show_status(&batch, state_dir),
        Command::List { state_dir } => list_batches(state_dir),
    }
}

async fn run_batch(
    tasks_path: &Path,
    concurrency: Option<usize>,
    state_dir: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let loaded = load_and_validate(tasks_path)
        .with_context(|| format!("loading task list {:?}", tasks_path))?;

    if dry_run {
        return print_dry_run(&loaded);
    }

    let mut options = loaded.file.settings.scheduler_options();
    if let Some(n) = concurrency {
        options.concurrency = n;
    }
    let state_dir = state_dir.unwrap_or_else(|| loaded.file.settings.state_dir.clone());

    let init = BatchInit::Fresh {
        name: loaded.name,
        source: loaded.source,
    };
    drive(loaded.file.tasks, init, state_dir, options).await
}

async fn resume_batch(
    batch_id: &str,
    state_dir: PathBuf,
    concurrency: Option<usize>,
    retry_failed: bool,
) -> Result<()> {
    let store = StateStore::new(&state_dir);
    let mut state = store
        .load(batch_id)
        .with_context(|| format!("loading batch {batch_id} from {:?}", state_dir))?;

    let file = reload_task_list(&RealFileSystem, &state.source)
        .with_context(|| format!("reloading the task list of batch {batch_id}"))?
        .file;

    if retry_failed {
        let mut failed: Vec<_> = state.ids_with_status(TaskStatus::Failed).into_iter().collect();
        failed.sort();
        for id in &failed {
            state.reset_for_retry(id)?;
        }
        if !failed.is_empty() {
            info!(tasks = ?failed, "failed tasks reset for retry");
        }
    }

    let mut options = file.settings.scheduler_options();
    if let Some(n) = concurrency {
        options.concurrency = n;
    }

    drive(file.tasks, BatchInit::Resume(state), state_dir, options).await
}

/// Run one batch to the end with the shell executor, the lifecycle printer,
/// the operator console and Ctrl-C wired up.
async fn drive(
    tasks: Vec<TaskDescriptor>,
    init: BatchInit,
    state_dir: PathBuf,
    options: SchedulerOptions,
) -> Result<()> {
    let store = StateStore::new(&state_dir);
    let executor: Arc<dyn Executor> = Arc::new(ResumeFallback::new(ShellExecutor::new()));

    let (scheduler, handle, mut events) = Scheduler::new(tasks, init, executor, store, options)?;
    let batch_id = scheduler.batch_id().to_string();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", render_event(&event));
        }
    });

    // Ctrl-C interrupts: running tasks stay resumable. `cancel-all` on the
    // console is the way to stop them for good.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; interrupting batch");
            let _ = handle.interrupt();
        });
    }

    let console = spawn_console(handle.clone());

    let final_state = scheduler.run().await?;
    console.abort();
    let _ = printer.await;

    if final_state.status == BatchStatus::Completed {
        return Ok(());
    }

    let mut message = match final_state.status {
        BatchStatus::Pending | BatchStatus::Running => format!("batch {batch_id} interrupted"),
        status => format!("batch {batch_id} {status}"),
    };
    if !final_state.deadlocked.is_empty() {
        message.push_str(&format!(
            ": deadlocked tasks {}",
            final_state.deadlocked.join(", ")
        ));
    }
    if let Some(hint) = resume_hint(&final_state, &state_dir) {
        message.push_str(&format!("; resume with `{hint}`"));
    }
    bail!(message)
}

fn show_status(batch_id: &str, state_dir: PathBuf) -> Result<()> {
    let store = StateStore::new(&state_dir);
    let state = store
        .read(batch_id)
        .with_context(|| format!("reading batch {batch_id} from {:?}", state_dir))?;

    // Blocked/queued need the graph; fall back to stored statuses without it.
    let graph = RealFileSystem
        .read(&state.source.path)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|contents| parse_batch_file(&contents).ok())
        .map(|file| DagGraph::new(&file.tasks));

    println!("{} ({}) [{}]", state.name, state.batch_id, state.status);
    if let Some(started) = state.started_at {
        println!("  started:   {}", started.to_rfc3339());
    }
    if let Some(completed) = state.completed_at {
        println!("  completed: {}", completed.to_rfc3339());
    }
    println!("  {}", derive_stats(&state));

    let order: Vec<String> = match &graph {
        Some(graph) => graph.tasks().map(str::to_string).collect(),
        None => state.tasks.keys().cloned().collect(),
    };
    for id in order {
        let Some(task) = state.task(&id) else {
            continue;
        };
        let display = graph
            .as_ref()
            .and_then(|g| state.display_status(g, &id))
            .map(|s| s.to_string())
            .unwrap_or_else(|| task.status.to_string());
        print!("  {id:<24} {display:<10} cost {:.4}", task.cost);
        if let Some(error) = &task.error {
            print!("  error: {error}");
        }
        println!();
    }

    if !state.deadlocked.is_empty() {
        println!("  deadlocked: {}", state.deadlocked.join(", "));
    }
    if let Some(hint) = resume_hint(&state, &state_dir) {
        println!("  resume with `{hint}`");
    }
    Ok(())
}

fn list_batches(state_dir: PathBuf) -> Result<()> {
    let store = StateStore::new(&state_dir);
    let summaries = store.list()?;
    if summaries.is_empty() {
        println!("no batches in {:?}", state_dir);
        return Ok(());
    }
    for summary in summaries {
        let started = summary
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<10} {:<20} {}  {}",
            summary.batch_id, summary.status, summary.name, started, summary.stats
        );
    }
    Ok(())
}

/// Print tasks, execution levels and the topological order.
fn print_dry_run(loaded: &LoadedBatch) -> Result<()> {
    let settings = &loaded.file.settings;
    let graph = DagGraph::validated(&loaded.file.tasks)?;

    println!("batchdag dry-run: {}", loaded.name);
    println!("  batch.concurrency = {}", settings.concurrency);
    println!("  batch.state_dir = {:?}", settings.state_dir);
    println!();

    println!("tasks ({}):", loaded.file.tasks.len());
    for task in &loaded.file.tasks {
        println!("  - {}", task.id);
        if !task.depends_on.is_empty() {
            println!("      depends_on: {:?}", task.depends_on);
        }
        if let Some(budget) = task.budget {
            println!("      budget: {budget}");
        }
        if let Some(cmd) = task.payload.get("cmd").and_then(|v| v.as_str()) {
            println!("      cmd: {cmd}");
        }
    }

    println!();
    println!("levels:");
    for (i, level) in graph.levels()?.iter().enumerate() {
        println!("  {i}: {}", level.join(", "));
    }
    println!("order: {}", graph.topological_order()?.join(" -> "));

    Ok(())
}
