// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::SchedulerOptions;
use crate::types::TaskDescriptor;

/// Task-list file as read from TOML, before validation.
///
/// ```toml
/// [batch]
/// name = "nightly"
/// concurrency = 2
/// state_dir = ".batchdag"
/// autosave_interval = "5s"
/// escalation_timeout = "2m"
///
/// [[task]]
/// id = "A"
/// depends_on = []
/// budget = 2.5
/// [task.payload]
/// cmd = "echo hello"
/// ```
///
/// The order of the `[[task]]` tables is the admission tie-break order.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBatchFile {
    #[serde(default)]
    pub batch: BatchSection,

    #[serde(default)]
    pub task: Vec<TaskConfig>,
}

/// `[batch]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSection {
    /// Display name; defaults to the file stem.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Duration string such as `"500ms"` or `"5s"`.
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval: String,

    /// Unanswered escalations are auto-resolved with "let the task decide"
    /// after this long. No timeout when absent.
    #[serde(default)]
    pub escalation_timeout: Option<String>,
}

fn default_concurrency() -> usize {
    1
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".batchdag")
}

fn default_autosave_interval() -> String {
    "5s".to_string()
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            name: None,
            concurrency: default_concurrency(),
            state_dir: default_state_dir(),
            autosave_interval: default_autosave_interval(),
            escalation_timeout: None,
        }
    }
}

/// One `[[task]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub id: String,

    #[serde(default = "default_context")]
    pub context: PathBuf,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub budget: Option<f64>,

    /// Executor-specific; passed through untouched.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

/// Validated `[batch]` settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub name: Option<String>,
    pub concurrency: usize,
    pub state_dir: PathBuf,
    pub autosave_interval: Duration,
    pub escalation_timeout: Option<Duration>,
}

impl BatchSettings {
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            concurrency: self.concurrency,
            autosave_interval: self.autosave_interval,
            escalation_timeout: self.escalation_timeout,
        }
    }
}

/// Validated task-list file.
///
/// Only obtainable through `TryFrom<RawBatchFile>`, so holding one means the
/// task graph is known to be well formed.
#[derive(Debug, Clone)]
pub struct BatchFile {
    pub settings: BatchSettings,
    pub tasks: Vec<TaskDescriptor>,
}

impl BatchFile {
    pub(crate) fn new_unchecked(settings: BatchSettings, tasks: Vec<TaskDescriptor>) -> Self {
        Self { settings, tasks }
    }
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        unit => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, or h"
        )),
    }
}
