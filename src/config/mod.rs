// src/config/mod.rs

//! Task-list loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a task-list file from disk (`loader.rs`).
//! - Validate ids, dependencies and acyclicity (`validate.rs`).
//!
//! The engine never depends on this module; it only consumes the
//! [`TaskDescriptor`](crate::types::TaskDescriptor)s produced here.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{
    LoadedBatch, ReloadedTaskList, default_tasks_path, load_and_validate, parse_batch_file,
    reload_task_list,
};
pub use model::{BatchFile, BatchSection, BatchSettings, RawBatchFile, TaskConfig, parse_duration};
pub use validate::validate_descriptors;
