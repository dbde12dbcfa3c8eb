// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::model::{BatchFile, RawBatchFile};
use crate::errors::{BatchdagError, Result};
use crate::fs::FileSystem;
use crate::state::SourceRef;

/// A validated task-list file plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedBatch {
    pub file: BatchFile,
    /// `[batch].name`, or the file stem.
    pub name: String,
    pub source: SourceRef,
}

/// Parse TOML into the raw model; no semantic validation.
pub fn parse_raw(contents: &str) -> Result<RawBatchFile> {
    let raw: RawBatchFile = toml::from_str(contents)?;
    Ok(raw)
}

/// Parse and validate a task list held in memory.
pub fn parse_batch_file(contents: &str) -> Result<BatchFile> {
    BatchFile::try_from(parse_raw(contents)?)
}

/// Load a task-list file and validate it.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` default functions).
/// - Checks ids, dependencies, budgets, durations and acyclicity.
/// - Records a digest of the file so a resumed batch can tell whether the
///   task list changed underneath it.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<LoadedBatch> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let contents = std::str::from_utf8(&bytes).map_err(|e| {
        BatchdagError::ConfigError(format!("task list {:?} is not valid UTF-8: {e}", path))
    })?;

    let file = parse_batch_file(contents)?;
    let name = file
        .settings
        .name
        .clone()
        .unwrap_or_else(|| default_batch_name(path));
    let source_path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    debug!(path = ?source_path, tasks = file.tasks.len(), "task list loaded");

    Ok(LoadedBatch {
        file,
        name,
        source: SourceRef::from_bytes(source_path, &bytes),
    })
}

/// The task list of a persisted batch, read again for `resume`.
#[derive(Debug, Clone)]
pub struct ReloadedTaskList {
    pub file: BatchFile,
    /// The file's digest no longer matches the one recorded at creation.
    pub changed: bool,
}

/// Re-read and validate the task list a batch was created from.
///
/// An edited file is still accepted (with a warning); reconciling its
/// tasks against the saved state is the scheduler's job.
pub fn reload_task_list<F: FileSystem>(fs: &F, source: &SourceRef) -> Result<ReloadedTaskList> {
    let bytes = fs.read(&source.path).map_err(|e| {
        BatchdagError::ConfigError(format!("reading task list {:?}: {e:#}", source.path))
    })?;
    let contents = std::str::from_utf8(&bytes).map_err(|e| {
        BatchdagError::ConfigError(format!(
            "task list {:?} is not valid UTF-8: {e}",
            source.path
        ))
    })?;
    let file = parse_batch_file(contents)?;

    let changed = !source.matches(&bytes);
    if changed {
        warn!(path = ?source.path, "task list changed since the batch was created");
    }
    Ok(ReloadedTaskList { file, changed })
}

fn default_batch_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "batch".to_string())
}

/// Default task-list path: `Batchdag.toml` in the current directory.
pub fn default_tasks_path() -> PathBuf {
    PathBuf::from("Batchdag.toml")
}
