// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::default_tasks_path;

/// Command-line arguments for `batchdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "batchdag",
    version,
    about = "Run a batch of dependent tasks with bounded concurrency and crash-safe resume.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `BATCHDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start a new batch from a task-list file.
    Run {
        /// Path to the task list (TOML).
        #[arg(long, value_name = "PATH", default_value_os_t = default_tasks_path())]
        tasks: PathBuf,

        /// Override `[batch].concurrency`.
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        /// Override `[batch].state_dir`.
        #[arg(long, value_name = "DIR")]
        state_dir: Option<PathBuf>,

        /// Parse + validate, print the execution order, but don't run anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Continue a persisted batch.
    Resume {
        #[arg(long, value_name = "ID")]
        batch: String,

        #[arg(long, value_name = "DIR", default_value = ".batchdag")]
        state_dir: PathBuf,

        /// Override `[batch].concurrency`.
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        /// Reset failed tasks to pending before continuing.
        #[arg(long)]
        retry_failed: bool,
    },

    /// Show the state of a persisted batch.
    Status {
        #[arg(long, value_name = "ID")]
        batch: String,

        #[arg(long, value_name = "DIR", default_value = ".batchdag")]
        state_dir: PathBuf,
    },

    /// List persisted batches.
    List {
        #[arg(long, value_name = "DIR", default_value = ".batchdag")]
        state_dir: PathBuf,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
