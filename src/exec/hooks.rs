// src/exec/hooks.rs

//! Lifecycle callbacks around each run of a [`crate::exec::SingleTask`].
//!
//! Order per trigger: `before_run`, then exactly one of `on_success`,
//! `on_error` or `on_timeout` (none when the run was skipped), then
//! `on_done`. Hooks run on the task's own loop, so they must not block.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::exec::TaskError;

/// The command about to be spawned. `before_run` may rewrite any of it, or
/// set `should_run` to false to skip the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    pub should_run: bool,
}

pub trait TaskHooks: Send + Sync {
    fn before_run(&self, _payload: &str, _plan: &mut RunPlan) {}
    fn on_success(&self) {}
    fn on_error(&self, _err: &TaskError) {}
    fn on_timeout(&self) {}
    fn on_done(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl TaskHooks for NoHooks {}

/// Hooks that log each outcome under the task's name.
#[derive(Debug, Clone)]
pub struct LogHooks {
    task: String,
}

impl LogHooks {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }
}

impl TaskHooks for LogHooks {
    fn before_run(&self, payload: &str, plan: &mut RunPlan) {
        info!(
            task = %self.task,
            payload,
            program = %plan.program,
            args = ?plan.args,
            "running task"
        );
    }

    fn on_success(&self) {
        info!(task = %self.task, "task succeeded");
    }

    fn on_error(&self, err: &TaskError) {
        warn!(task = %self.task, error = %err, "task failed");
    }

    fn on_timeout(&self) {
        warn!(
            task = %self.task,
            "task timed out; its process is left running"
        );
    }
}
