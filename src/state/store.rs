// src/state/store.rs

//! Durable batch state.
//!
//! One pretty-printed JSON file per batch, `<dir>/<batch_id>.json`, written
//! with temp-file-then-rename so concurrent readers never observe a partial
//! snapshot.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::errors::{BatchdagError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::state::model::{
    BatchState, BatchStats, BatchStatus, SourceRef, TaskRuntimeState, TaskStatus, TaskUpdate,
};
use crate::types::{BatchId, TaskId};

/// One line of `batchdag list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub name: String,
    pub status: BatchStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stats: BatchStats,
}

/// Loads and saves [`BatchState`] snapshots under one directory.
#[derive(Debug, Clone)]
pub struct StateStore<F: FileSystem = RealFileSystem> {
    fs: F,
    dir: PathBuf,
}

impl StateStore<RealFileSystem> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_fs(RealFileSystem, dir)
    }
}

impl<F: FileSystem> StateStore<F> {
    pub fn with_fs(fs: F, dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{batch_id}.json"))
    }

    /// Atomically persist `state`, returning where it was written.
    ///
    /// On failure the previous snapshot (if any) is left intact.
    pub fn save(&self, state: &BatchState) -> Result<PathBuf> {
        let path = self.path_for(&state.batch_id);
        let json = serde_json::to_vec_pretty(state)?;

        self.fs.write_atomic(&path, &json).map_err(|e| {
            error!(batch_id = %state.batch_id, path = ?path, error = %e, "failed to persist batch state");
            BatchdagError::PersistenceFailure(format!("{e:#}"))
        })?;

        debug!(batch_id = %state.batch_id, path = ?path, "batch state saved");
        Ok(path)
    }

    /// Read a snapshot exactly as it was written.
    pub fn read(&self, batch_id: &str) -> Result<BatchState> {
        self.read_path(&self.path_for(batch_id))
    }

    pub fn read_path(&self, path: &Path) -> Result<BatchState> {
        let bytes = self
            .fs
            .read(path)
            .map_err(|e| BatchdagError::PersistenceFailure(format!("{e:#}")))?;
        let state: BatchState = serde_json::from_slice(&bytes)?;
        Ok(state)
    }

    /// Read a snapshot and prepare it for resumption (see [`prepare_resume`]).
    pub fn load(&self, batch_id: &str) -> Result<BatchState> {
        let mut state = self.read(batch_id)?;
        let reset = prepare_resume(&mut state);
        if !reset.is_empty() {
            info!(
                batch_id = %state.batch_id,
                tasks = ?reset,
                "tasks recorded as running were reset to pending"
            );
        }
        Ok(state)
    }

    /// Summaries of every batch in the directory, oldest first.
    pub fn list(&self) -> Result<Vec<BatchSummary>> {
        if !self.fs.exists(&self.dir) {
            return Ok(Vec::new());
        }

        let entries = self
            .fs
            .read_dir(&self.dir)
            .map_err(|e| BatchdagError::PersistenceFailure(format!("{e:#}")))?;

        let mut summaries = Vec::new();
        for path in entries {
            let is_snapshot = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_snapshot {
                continue;
            }
            match self.read_path(&path) {
                Ok(state) => summaries.push(BatchSummary {
                    stats: BatchStats::from_state(&state),
                    batch_id: state.batch_id,
                    name: state.name,
                    status: state.status,
                    started_at: state.started_at,
                }),
                Err(e) => debug!(path = ?path, error = %e, "skipping unreadable state file"),
            }
        }

        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(summaries)
    }
}

/// Fresh state: every task `pending`, no cost.
pub fn create_initial(
    batch_id: impl Into<BatchId>,
    name: impl Into<String>,
    source: SourceRef,
    task_ids: impl IntoIterator<Item = TaskId>,
) -> BatchState {
    BatchState {
        batch_id: batch_id.into(),
        name: name.into(),
        source,
        started_at: None,
        completed_at: None,
        status: BatchStatus::Pending,
        total_cost: 0.0,
        cancel_requested: false,
        deadlocked: Vec::new(),
        tasks: task_ids
            .into_iter()
            .map(|id| (id, TaskRuntimeState::default()))
            .collect(),
    }
}

/// Return `state` with one task's fields merged from `update`.
pub fn mutate_task(mut state: BatchState, task_id: &str, update: TaskUpdate) -> Result<BatchState> {
    state.apply(task_id, update)?;
    Ok(state)
}

pub fn derive_stats(state: &BatchState) -> BatchStats {
    BatchStats::from_state(state)
}

/// Apply the resume rule to a reloaded snapshot.
///
/// A `running` status written by a process that is gone cannot be trusted,
/// so those tasks go back to `pending`. Nothing else changes: the session
/// token stays so the executor can continue the same session, and leftover
/// progress or escalation fields are overwritten when the task is admitted
/// again. Returns the ids that were reset.
pub fn prepare_resume(state: &mut BatchState) -> Vec<TaskId> {
    let mut reset = Vec::new();

    for (id, task) in state.tasks.iter_mut() {
        if task.status == TaskStatus::Running {
            task.status = TaskStatus::Pending;
            reset.push(id.clone());
        }
    }

    reset
}
