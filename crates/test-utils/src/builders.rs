#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::PathBuf;

use batchdag::types::TaskDescriptor;
use serde_json::json;

/// Builder for one `TaskDescriptor`.
pub struct DescriptorBuilder {
    task: TaskDescriptor,
}

impl DescriptorBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            task: TaskDescriptor::new(id),
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.depends_on.push(dep.to_string());
        self
    }

    pub fn budget(mut self, budget: f64) -> Self {
        self.task.budget = Some(budget);
        self
    }

    pub fn context(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task.context = dir.into();
        self
    }

    /// Shell command for `ShellExecutor`.
    pub fn cmd(mut self, cmd: &str) -> Self {
        self.task.payload = json!({ "cmd": cmd });
        self
    }

    pub fn build(self) -> TaskDescriptor {
        self.task
    }
}

/// Builder for a batch's task list, kept in declaration order.
#[derive(Default)]
pub struct BatchBuilder {
    tasks: Vec<TaskDescriptor>,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task depending on `deps`.
    pub fn task(mut self, id: &str, deps: &[&str]) -> Self {
        let mut builder = DescriptorBuilder::new(id);
        for dep in deps {
            builder = builder.after(dep);
        }
        self.tasks.push(builder.build());
        self
    }

    pub fn with(mut self, descriptor: TaskDescriptor) -> Self {
        self.tasks.push(descriptor);
        self
    }

    pub fn build(self) -> Vec<TaskDescriptor> {
        self.tasks
    }

    /// Render the tasks as a TOML task-list file with the given `[batch]`
    /// body.
    pub fn to_toml(&self, batch_section: &str) -> String {
        let mut out = format!("[batch]\n{batch_section}\n");
        for task in &self.tasks {
            let _ = writeln!(out, "\n[[task]]");
            let _ = writeln!(out, "id = {:?}", task.id);
            let deps: Vec<String> = task.depends_on.iter().map(|d| format!("{d:?}")).collect();
            let _ = writeln!(out, "depends_on = [{}]", deps.join(", "));
            if let Some(budget) = task.budget {
                let _ = writeln!(out, "budget = {budget:?}");
            }
            if let Some(cmd) = task.payload.get("cmd").and_then(|v| v.as_str()) {
                let _ = writeln!(out, "[task.payload]\ncmd = {cmd:?}");
            }
        }
        out
    }
}
