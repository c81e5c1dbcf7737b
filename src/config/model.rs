// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::exec::{InterpreterTable, TaskOpts};
use crate::types::{OpKind, OutputMode};
use crate::watch::WatchConfig;

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [[interpreter]]
/// ext = ".py"
/// prefix = ["python3"]
///
/// [task.lint]
/// cmd = "eslint {{fileName}}"
/// timeout = "30s"
///
/// [[watcher]]
/// dir = "web"
/// ext = "js"
/// exclude_dirs = ["node_modules", "tmp*"]
/// tasks = ["lint"]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    /// When present, replaces the default interpreter table entirely.
    #[serde(default)]
    pub interpreter: Option<Vec<InterpreterEntry>>,

    /// All tasks from `[task.<name>]`.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,

    /// All `[[watcher]]` entries, in file order.
    #[serde(default)]
    pub watcher: Vec<WatcherConfig>,
}

/// `[[interpreter]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterpreterEntry {
    pub ext: String,
    pub prefix: Vec<String>,
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Command template; `{{fileName}}` is replaced by the changed path.
    pub cmd: String,

    /// Working directory, relative to the config file's directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Duration string such as `"30s"`. Defaults to 600s.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Defaults to `console`, or `captured` for persistent tasks.
    #[serde(default)]
    pub output: Option<OutputMode>,

    /// Defaults to true.
    #[serde(default)]
    pub clear_screen: Option<bool>,

    /// Start the command once and feed it changed paths on stdin.
    #[serde(default)]
    pub persistent: bool,

    #[serde(default)]
    pub delimiter: Option<String>,

    #[serde(default)]
    pub idle_grace: Option<String>,
}

/// `[[watcher]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatcherConfig {
    /// Shown in logs; defaults to `watcher-<index>`.
    #[serde(default)]
    pub name: Option<String>,

    /// Root directory, relative to the config file's directory.
    #[serde(default = "default_watch_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub ext: Option<String>,

    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default)]
    pub exclude_dirs: Vec<String>,

    /// Defaults to `["chmod"]`.
    #[serde(default)]
    pub ignore: Option<Vec<OpKind>>,

    #[serde(default)]
    pub event_cutoff: Option<String>,

    #[serde(default)]
    pub event_capacity: Option<usize>,

    /// Names of the tasks this watcher triggers.
    #[serde(default)]
    pub tasks: Vec<String>,

    /// Run the (single) task in every directory holding matching files.
    #[serde(default)]
    pub discover: bool,
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from(".")
}

/// A validated task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub opts: TaskOpts,
    pub persistent: bool,
}

/// A validated watcher and what it triggers.
#[derive(Debug, Clone)]
pub struct WatcherSpec {
    pub name: String,
    pub config: WatchConfig,
    pub tasks: Vec<String>,
    pub discover: bool,
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>`, so every watcher's task
/// references resolve and every duration has been parsed.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    interpreters: InterpreterTable,
    tasks: BTreeMap<String, TaskSpec>,
    watchers: Vec<WatcherSpec>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        interpreters: InterpreterTable,
        tasks: BTreeMap<String, TaskSpec>,
        watchers: Vec<WatcherSpec>,
    ) -> Self {
        Self {
            interpreters,
            tasks,
            watchers,
        }
    }

    pub fn interpreters(&self) -> &InterpreterTable {
        &self.interpreters
    }

    pub fn tasks(&self) -> &BTreeMap<String, TaskSpec> {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    pub fn watchers(&self) -> &[WatcherSpec] {
        &self.watchers
    }

    /// Resolve relative watcher roots and task directories against `base`
    /// (normally the directory holding the config file).
    pub fn rooted_at(mut self, base: &Path) -> Self {
        for watcher in &mut self.watchers {
            if watcher.config.dir.is_relative() {
                watcher.config.dir = base.join(&watcher.config.dir);
            }
        }
        for spec in self.tasks.values_mut() {
            if let Some(dir) = &spec.opts.dir {
                if dir.is_relative() {
                    spec.opts.dir = Some(base.join(dir));
                }
            }
        }
        self
    }
}
