// src/watch/mod.rs

//! File watching and change detection.
//!
//! This module is responsible for:
//! - Registering a directory tree (or an explicit file list) with a
//!   cross-platform filesystem watcher (`notify`).
//! - Running every raw notification through the dedup / suppress / ignore /
//!   new-directory / relevance pipeline in [`filter`].
//! - Exposing the surviving notifications as a stream of [`WatchEvent`]s,
//!   plus a stream of non-fatal [`WatchError`]s.
//!
//! It does **not** know about tasks; the orchestrator in [`crate::engine`]
//! turns events into task triggers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::OpKind;

pub mod filter;
pub mod path_utils;
pub mod patterns;
pub mod register;
pub mod watcher;

pub use filter::{DropReason, EventFilter, Verdict};
pub use patterns::ExcludeSet;
pub use watcher::{SuppressFlag, WatchStreams, Watcher, WatcherGuard};

/// Default minimum gap between two identical notifications.
pub const DEFAULT_EVENT_CUTOFF: Duration = Duration::from_millis(10);

/// Default capacity of the filtered event stream.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Capacity of the error stream; overflow drops the newest error.
pub const ERROR_CAPACITY: usize = 32;

/// What to watch and which notifications qualify.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Root directory. Relative paths are resolved against the current dir.
    pub dir: PathBuf,
    /// Extension filter, with or without the leading dot (`"js"`, `".js"`).
    pub ext: Option<String>,
    /// Explicit file list relative to `dir`. When non-empty, replaces the
    /// recursive directory walk.
    pub files: Vec<String>,
    /// Root-relative directory patterns to skip (`"node_modules"`, `"tmp*"`).
    pub exclude_dirs: Vec<String>,
    /// Operation kinds that never produce an event.
    pub ignore: Vec<OpKind>,
    /// Identical (path, kind) notifications closer together than this are
    /// collapsed into one.
    pub event_cutoff: Duration,
    /// Capacity of the bounded event stream.
    pub event_capacity: usize,
}

impl WatchConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// True when an explicit file list overrides the directory walk.
    pub fn uses_file_list(&self) -> bool {
        !self.files.is_empty()
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            ext: None,
            files: Vec::new(),
            exclude_dirs: Vec::new(),
            ignore: vec![OpKind::Chmod],
            event_cutoff: DEFAULT_EVENT_CUTOFF,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// A qualifying filesystem change. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub op: OpKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, op: OpKind) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }

    /// The event path as a trigger payload.
    pub fn payload(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Non-fatal failures reported on a watcher's error stream.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("file watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("unable to get file info for {path:?}: {message}")]
    Stat { path: PathBuf, message: String },

    #[error("failed to watch new directory {path:?}: {source}")]
    Register {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("failed to walk new directory {path:?}: {message}")]
    Walk { path: PathBuf, message: String },
}
