// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`backend`] defines the [`Executor`] trait and the
//!   [`ExecutionContext`] an executor uses to report back (progress, tool
//!   use, cost, session tokens, escalations) and to observe cancellation.
//! - [`chain`] provides [`ResumeFallback`] and [`ExecutorChain`].
//! - [`command`] is the production [`ShellExecutor`], which runs a shell
//!   command per task using `tokio::process::Command`.

pub mod backend;
pub mod chain;
pub mod command;

pub use backend::{
    CancelHandle, CancelSignal, ExecFuture, ExecutionContext, Executor, TaskRun, cancel_pair,
};
pub use chain::{ExecutorChain, ResumeFallback};
pub use command::ShellExecutor;
