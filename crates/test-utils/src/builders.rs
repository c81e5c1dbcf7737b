#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use watchrun::config::{ConfigFile, RawConfigFile, TaskConfig, WatcherConfig};
use watchrun::types::{OpKind, OutputMode};
use watchrun::watch::WatchConfig;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                interpreter: None,
                task: BTreeMap::new(),
                watcher: Vec::new(),
            },
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn with_watcher(mut self, watcher: WatcherConfig) -> Self {
        self.config.watcher.push(watcher);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                cmd: cmd.to_string(),
                dir: None,
                timeout: None,
                output: None,
                clear_screen: Some(false),
                persistent: false,
                delimiter: None,
                idle_grace: None,
            },
        }
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.task.timeout = Some(timeout.to_string());
        self
    }

    pub fn captured(mut self) -> Self {
        self.task.output = Some(OutputMode::Captured);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.task.persistent = true;
        self
    }

    pub fn delimiter(mut self, delim: &str) -> Self {
        self.task.delimiter = Some(delim.to_string());
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task.dir = Some(dir.into());
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Builder for `[[watcher]]` entries.
pub struct WatcherConfigBuilder {
    watcher: WatcherConfig,
}

impl WatcherConfigBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            watcher: WatcherConfig {
                name: None,
                dir: dir.into(),
                ext: None,
                files: Vec::new(),
                exclude_dirs: Vec::new(),
                ignore: None,
                event_cutoff: None,
                event_capacity: None,
                tasks: Vec::new(),
                discover: false,
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.watcher.name = Some(name.to_string());
        self
    }

    pub fn ext(mut self, ext: &str) -> Self {
        self.watcher.ext = Some(ext.to_string());
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.watcher.exclude_dirs.push(pattern.to_string());
        self
    }

    pub fn task(mut self, task: &str) -> Self {
        self.watcher.tasks.push(task.to_string());
        self
    }

    pub fn discover(mut self) -> Self {
        self.watcher.discover = true;
        self
    }

    pub fn build(self) -> WatcherConfig {
        self.watcher
    }
}

/// Builder for runtime `WatchConfig`s used directly with `Watcher::new`.
pub struct WatchConfigBuilder {
    config: WatchConfig,
}

impl WatchConfigBuilder {
    pub fn new(dir: &Path) -> Self {
        Self {
            config: WatchConfig::new(dir),
        }
    }

    pub fn ext(mut self, ext: &str) -> Self {
        self.config.ext = Some(ext.to_string());
        self
    }

    pub fn file(mut self, file: &str) -> Self {
        self.config.files.push(file.to_string());
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.config.exclude_dirs.push(pattern.to_string());
        self
    }

    pub fn ignore(mut self, kinds: &[OpKind]) -> Self {
        self.config.ignore = kinds.to_vec();
        self
    }

    pub fn cutoff(mut self, cutoff: Duration) -> Self {
        self.config.event_cutoff = cutoff;
        self
    }

    pub fn build(self) -> WatchConfig {
        self.config
    }
}
