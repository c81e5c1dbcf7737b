// src/engine/discovery.rs

//! Running one task in every directory that holds matching files.
//!
//! Typical use is a test runner: a change anywhere re-runs the tests of the
//! changed package first, then of every other package, one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::exec::{RunOutcome, RunReport, Task, TaskError, Trigger};
use crate::fs::{FileSystem, RealFileSystem};
use crate::watch::path_utils::has_extension;
use crate::watch::register::collect_watch_dirs;
use crate::watch::{ExcludeSet, SuppressFlag, WatchConfig, WatchEvent};

/// One run of the shared task in one directory.
#[derive(Debug)]
pub struct DirRun {
    pub dir: PathBuf,
    pub report: std::result::Result<RunReport, TaskError>,
}

#[derive(Debug)]
pub struct DiscoveryRunner {
    task: Arc<dyn Task>,
    root: PathBuf,
    ext: Option<String>,
    exclude: ExcludeSet,
    fs: Arc<dyn FileSystem>,
    eligible: Vec<PathBuf>,
}

impl DiscoveryRunner {
    /// `root` should be the watcher's canonical root so event paths and
    /// discovered directories compare equal.
    pub fn new(task: Arc<dyn Task>, root: PathBuf, config: &WatchConfig) -> Result<Self> {
        Self::with_fs(task, root, config, Arc::new(RealFileSystem))
    }

    pub fn with_fs(
        task: Arc<dyn Task>,
        root: PathBuf,
        config: &WatchConfig,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        let exclude = ExcludeSet::new(&config.exclude_dirs)?;
        let mut runner = Self {
            task,
            root,
            ext: config.ext.clone(),
            exclude,
            fs,
            eligible: Vec::new(),
        };
        runner.refresh()?;
        Ok(runner)
    }

    /// Directories the task currently runs in, sorted.
    pub fn eligible_dirs(&self) -> &[PathBuf] {
        &self.eligible
    }

    /// Re-walk the tree.
    pub fn refresh(&mut self) -> Result<()> {
        let dirs = collect_watch_dirs(self.fs.as_ref(), &self.root, &self.root, &self.exclude)?;
        let mut eligible = Vec::new();
        for dir in dirs {
            if self.has_qualifying_file(&dir)? {
                eligible.push(dir);
            }
        }
        eligible.sort();
        debug!(root = ?self.root, dirs = eligible.len(), "discovered eligible directories");
        self.eligible = eligible;
        Ok(())
    }

    fn has_qualifying_file(&self, dir: &Path) -> Result<bool> {
        for entry in self.fs.read_dir(dir)? {
            if !self.fs.is_file(&entry) {
                continue;
            }
            match &self.ext {
                Some(ext) if !has_extension(&entry, ext) => continue,
                _ => return Ok(true),
            }
        }
        Ok(false)
    }

    /// Run the task for `event`: first in the event's directory, then in
    /// every other eligible directory, strictly one after another.
    pub async fn handle(&mut self, event: &WatchEvent, suppress: &SuppressFlag) -> Vec<DirRun> {
        suppress.set(true);

        let first_dir = event
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let mut runs = Vec::new();
        let first = self.run_in(&first_dir, event.payload()).await;
        let first_ok = first.report.as_ref().is_ok_and(|r| r.outcome.is_success());
        runs.push(first);

        if first_ok {
            self.refresh_logged();
        }

        let others: Vec<PathBuf> = self
            .eligible
            .iter()
            .filter(|d| **d != first_dir)
            .cloned()
            .collect();

        for dir in others {
            let payload = dir.to_string_lossy().into_owned();
            let run = self.run_in(&dir, payload).await;
            if run.report.as_ref().is_ok_and(|r| r.outcome.is_success()) {
                self.refresh_logged();
            }
            runs.push(run);
        }

        suppress.set(false);
        runs
    }

    async fn run_in(&self, dir: &Path, payload: String) -> DirRun {
        info!(task = %self.task.name(), dir = ?dir, "running in directory");

        let report = match self.task.dispatch(Trigger::new(payload).in_dir(dir)).await {
            Ok(completion) => completion.wait().await,
            Err(err) => Err(err),
        };

        if let Ok(RunReport {
            outcome: RunOutcome::TimedOut,
            ..
        }) = &report
        {
            info!(task = %self.task.name(), dir = ?dir, "unblocking long run");
            if let Err(err) = self.task.kill().await {
                warn!(task = %self.task.name(), error = %err, "failed to kill timed-out run");
            }
        }

        DirRun {
            dir: dir.to_path_buf(),
            report,
        }
    }

    fn refresh_logged(&mut self) {
        if let Err(err) = self.refresh() {
            warn!(
                root = ?self.root,
                error = %format!("{err:#}"),
                "failed to re-walk tree; keeping previous directories"
            );
        }
    }
}
