// src/state/mod.rs

//! Batch state and its persistence.
//!
//! - [`model`] defines [`BatchState`], [`TaskRuntimeState`] and the status
//!   enums.
//! - [`store`] owns durable save/load and the resume rule.

pub mod model;
pub mod store;

pub use model::{
    BatchState, BatchStats, BatchStatus, DisplayStatus, SourceRef, TaskRuntimeState, TaskStatus,
    TaskUpdate,
};
pub use store::{
    BatchSummary, StateStore, create_initial, derive_stats, mutate_task, prepare_resume,
};
