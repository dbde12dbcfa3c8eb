// src/config/validate.rs

use std::collections::HashSet;

use crate::config::model::{BatchFile, BatchSettings, RawBatchFile, parse_duration};
use crate::dag::DagGraph;
use crate::errors::{BatchdagError, Result};
use crate::types::TaskDescriptor;

impl TryFrom<RawBatchFile> for BatchFile {
    type Error = BatchdagError;

    fn try_from(raw: RawBatchFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_tasks(&raw)?;
        let settings = validate_batch_section(&raw)?;
        validate_task_ids(&raw)?;
        validate_task_dependencies(&raw)?;
        validate_budgets(&raw)?;

        let tasks = build_descriptors(raw);
        // Cycle check through the resolver itself.
        DagGraph::validated(&tasks)?;

        Ok(BatchFile::new_unchecked(settings, tasks))
    }
}

/// Validate an already-built descriptor list (for callers that don't go
/// through a task-list file).
pub fn validate_descriptors(tasks: &[TaskDescriptor]) -> Result<()> {
    for task in tasks {
        if task.depends_on.iter().any(|dep| dep == &task.id) {
            return Err(self_dependency(&task.id));
        }
    }
    DagGraph::validated(tasks)?;
    Ok(())
}

fn ensure_has_tasks(cfg: &RawBatchFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(BatchdagError::ConfigError(
            "task list must contain at least one [[task]] table".to_string(),
        ));
    }
    Ok(())
}

fn validate_batch_section(cfg: &RawBatchFile) -> Result<BatchSettings> {
    let batch = &cfg.batch;

    if batch.concurrency == 0 {
        return Err(BatchdagError::ConfigError(
            "[batch].concurrency must be >= 1 (got 0)".to_string(),
        ));
    }

    let autosave_interval = parse_duration(&batch.autosave_interval)
        .map_err(|e| BatchdagError::ConfigError(format!("[batch].autosave_interval: {e}")))?;
    if autosave_interval.is_zero() {
        return Err(BatchdagError::ConfigError(
            "[batch].autosave_interval must be greater than zero".to_string(),
        ));
    }

    let escalation_timeout = batch
        .escalation_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| BatchdagError::ConfigError(format!("[batch].escalation_timeout: {e}")))?;

    Ok(BatchSettings {
        name: batch.name.clone(),
        concurrency: batch.concurrency,
        state_dir: batch.state_dir.clone(),
        autosave_interval,
        escalation_timeout,
    })
}

fn validate_task_ids(cfg: &RawBatchFile) -> Result<()> {
    let mut seen = HashSet::new();
    for task in &cfg.task {
        if task.id.trim().is_empty() {
            return Err(BatchdagError::ConfigError(
                "every [[task]] needs a non-empty `id`".to_string(),
            ));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(BatchdagError::DuplicateTask(task.id.clone()));
        }
    }
    Ok(())
}

fn validate_task_dependencies(cfg: &RawBatchFile) -> Result<()> {
    let ids: HashSet<&str> = cfg.task.iter().map(|t| t.id.as_str()).collect();
    for task in &cfg.task {
        for dep in &task.depends_on {
            if dep == &task.id {
                return Err(self_dependency(&task.id));
            }
            if !ids.contains(dep.as_str()) {
                return Err(BatchdagError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_budgets(cfg: &RawBatchFile) -> Result<()> {
    for task in &cfg.task {
        if let Some(budget) = task.budget {
            if !budget.is_finite() || budget < 0.0 {
                return Err(BatchdagError::ConfigError(format!(
                    "task '{}' has an invalid budget {budget}",
                    task.id
                )));
            }
        }
    }
    Ok(())
}

/// Descriptors in declaration order, with repeated dependencies collapsed.
fn build_descriptors(raw: RawBatchFile) -> Vec<TaskDescriptor> {
    raw.task
        .into_iter()
        .map(|task| {
            let mut seen = HashSet::new();
            let depends_on = task
                .depends_on
                .into_iter()
                .filter(|dep| seen.insert(dep.clone()))
                .collect();
            TaskDescriptor {
                id: task.id,
                context: task.context,
                depends_on,
                budget: task.budget,
                payload: task.payload,
            }
        })
        .collect()
}

fn self_dependency(task: &str) -> BatchdagError {
    BatchdagError::ConfigError(format!("task '{task}' cannot depend on itself"))
}
