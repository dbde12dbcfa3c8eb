// src/exec/chain.rs

//! Executor combinators.

use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::ExecutionError;
use crate::exec::backend::{ExecFuture, ExecutionContext, Executor, TaskRun};

/// Retries once with a fresh session when resuming an earlier session fails.
///
/// Cancellation is never retried.
#[derive(Debug, Clone)]
pub struct ResumeFallback<E> {
    inner: E,
}

impl<E: Executor> ResumeFallback<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: Executor> Executor for ResumeFallback<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run<'a>(&'a self, run: TaskRun, ctx: ExecutionContext) -> ExecFuture<'a> {
        Box::pin(async move {
            if run.resume_token.is_none() {
                return self.inner.run(run, ctx).await;
            }

            let fresh = run.fresh();
            match self.inner.run(run, ctx.clone()).await {
                Err(ExecutionError::Failed(reason)) if !ctx.is_cancelled() => {
                    warn!(
                        task = %fresh.id(),
                        executor = self.inner.name(),
                        %reason,
                        "resuming session failed; starting a fresh one"
                    );
                    self.inner.run(fresh, ctx).await
                }
                other => other,
            }
        })
    }
}

/// Ranked list of executors, tried in order until one succeeds.
#[derive(Clone, Default)]
pub struct ExecutorChain {
    executors: Vec<Arc<dyn Executor>>,
}

impl std::fmt::Debug for ExecutorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.executors.iter().map(|e| e.name()).collect();
        f.debug_struct("ExecutorChain").field("executors", &names).finish()
    }
}

impl ExecutorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl Executor for ExecutorChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn run<'a>(&'a self, run: TaskRun, ctx: ExecutionContext) -> ExecFuture<'a> {
        Box::pin(async move {
            let mut failures = Vec::new();

            for executor in &self.executors {
                if ctx.is_cancelled() {
                    return Err(ExecutionError::Cancelled);
                }
                match executor.run(run.clone(), ctx.clone()).await {
                    Ok(result) => return Ok(result),
                    Err(ExecutionError::Cancelled) => return Err(ExecutionError::Cancelled),
                    Err(ExecutionError::Failed(reason)) => {
                        info!(
                            task = %run.id(),
                            executor = executor.name(),
                            %reason,
                            "executor failed; trying next"
                        );
                        failures.push(format!("{}: {}", executor.name(), reason));
                    }
                }
            }

            if failures.is_empty() {
                Err(ExecutionError::Failed("no executors configured".to_string()))
            } else {
                Err(ExecutionError::Failed(failures.join("; ")))
            }
        })
    }
}
