// src/exec/mod.rs

//! Process execution layer.
//!
//! This module is responsible for actually running commands in response to
//! triggers, using `tokio::process::Command`, and reporting back to callers
//! through lifecycle hooks and per-run completion signals.
//!
//! - [`command`] turns a command template plus trigger payload into a
//!   program and argument list, consulting the [`InterpreterTable`].
//! - [`hooks`] defines the [`TaskHooks`] lifecycle callbacks.
//! - [`single`] runs one process per trigger ([`SingleTask`]).
//! - [`persistent`] feeds triggers to one long-lived process
//!   ([`PersistentTask`]), using the readers in [`reader`].

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::types::OutputMode;

pub mod command;
pub mod hooks;
pub mod persistent;
pub mod reader;
pub mod single;

pub use command::{CommandTemplate, InterpreterTable, PLACEHOLDER, ResolvedCommand};
pub use hooks::{LogHooks, NoHooks, RunPlan, TaskHooks};
pub use persistent::{PersistentStreams, PersistentTask};
pub use single::{RunState, SingleTask};

/// Default per-run timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How a task runs its command. Immutable once the task is constructed.
#[derive(Debug, Clone)]
pub struct TaskOpts {
    /// Command template; every `{{fileName}}` is replaced by the payload.
    pub cmd: String,
    /// Working directory override for the spawned process.
    pub dir: Option<PathBuf>,
    /// How long a run (or a persistent response) may take before it is
    /// reported as timed out. The process is never killed because of it.
    pub timeout: Duration,
    pub output: OutputMode,
    /// Clear the terminal before each run.
    pub clear_screen: bool,
    /// Persistent tasks only: end-of-response marker.
    pub delimiter: Option<String>,
    /// Persistent tasks only: how long a drained stream may stay quiet before
    /// the collected lines count as one response. Zero means "as soon as a
    /// read would block".
    pub idle_grace: Duration,
}

impl TaskOpts {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }
}

impl Default for TaskOpts {
    fn default() -> Self {
        Self {
            cmd: String::new(),
            dir: None,
            timeout: DEFAULT_TIMEOUT,
            output: OutputMode::default(),
            clear_screen: true,
            delimiter: None,
            idle_grace: Duration::ZERO,
        }
    }
}

/// One trigger for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Usually the changed file's path.
    pub payload: String,
    /// Per-trigger working directory; wins over [`TaskOpts::dir`].
    pub dir: Option<PathBuf>,
}

impl Trigger {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

/// Failures while running a task. Reported through [`TaskHooks::on_error`]
/// and [`RunOutcome::Errored`]; none of them stop the task from accepting
/// further triggers.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("command is empty after substitution")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command failed with {0}")]
    Exit(ExitStatus),

    #[error("failed waiting for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("process was killed")]
    Killed,

    #[error("no process to kill")]
    NoProcess,

    #[error("failed to kill process: {0}")]
    Kill(#[source] std::io::Error),

    #[error("failed to write to process stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("failed to read process output: {0}")]
    Read(#[source] std::io::Error),

    #[error("process wrote to stderr: {0}")]
    ErrorOutput(String),

    #[error("persistent process closed its output streams")]
    ProcessExited,

    #[error("task '{0}' is no longer running")]
    Closed(String),
}

/// How a single run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded,
    Errored(TaskError),
    /// The run outlived its timeout. Not an error: the process may still be
    /// running and must be killed explicitly if unwanted.
    TimedOut,
    /// `should_run` was false; nothing was spawned.
    Skipped,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

/// Everything a caller learns about a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub payload: String,
    pub outcome: RunOutcome,
    /// Captured stdout (captured output mode) or the response text
    /// (persistent task, stdout won).
    pub stdout: Option<String>,
    /// Captured stderr, or the persistent response that arrived on stderr.
    pub stderr: Option<String>,
    pub elapsed: Duration,
}

/// Per-run completion signal. Resolves after `on_done` has fired.
#[derive(Debug)]
pub struct Completion {
    task: String,
    rx: oneshot::Receiver<RunReport>,
}

impl Completion {
    pub fn new(task: impl Into<String>, rx: oneshot::Receiver<RunReport>) -> Self {
        Self {
            task: task.into(),
            rx,
        }
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunReport, TaskError> {
        self.rx.await.map_err(|_| TaskError::Closed(self.task))
    }
}

/// Boxed future returned by [`Task`] methods.
pub type TaskFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TaskError>> + Send + 'a>>;

/// What the orchestrator needs from a task.
///
/// Production code uses [`SingleTask`] and [`PersistentTask`]; tests can
/// provide implementations that never spawn processes.
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Hand a trigger to the task. Waits while a previous trigger is still
    /// in flight; the returned [`Completion`] resolves when this one is done.
    fn dispatch(&self, trigger: Trigger) -> TaskFuture<'_, Completion>;

    /// Terminate the task's current process immediately.
    fn kill(&self) -> TaskFuture<'_, ()>;

    /// Persistent processes read triggers line by line.
    fn wants_newline(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name()).finish()
    }
}

/// Clear the terminal and home the cursor.
pub(crate) fn clear_screen() {
    use std::io::Write;

    print!("\x1b[2J\x1b[0;0H");
    let _ = std::io::stdout().flush();
}
