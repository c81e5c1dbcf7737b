// src/watch/watcher.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::errors::{Result, WatchrunError};
use crate::fs::{FileSystem, RealFileSystem};
use crate::watch::filter::{EventFilter, Verdict, op_kind};
use crate::watch::patterns::ExcludeSet;
use crate::watch::register::{collect_watch_dirs, file_list_dirs};
use crate::watch::{ERROR_CAPACITY, WatchConfig, WatchError, WatchEvent};

/// Shared on/off switch that makes a watcher drop every notification.
///
/// Cloned into whoever runs tasks on behalf of the watcher, so files written
/// by those tasks do not re-trigger it.
#[derive(Debug, Clone, Default)]
pub struct SuppressFlag(Arc<AtomicBool>);

impl SuppressFlag {
    pub fn set(&self, suppressed: bool) {
        self.0.store(suppressed, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Keeps a watcher's background loop (and the OS watches) alive.
///
/// Dropping it stops the loop, which drops the `notify` watcher.
#[derive(Debug)]
pub struct WatcherGuard {
    _shutdown: oneshot::Sender<()>,
}

/// A watcher split into its parts, for callers that consume the event and
/// error streams from different tasks.
#[derive(Debug)]
pub struct WatchStreams {
    pub events: mpsc::Receiver<WatchEvent>,
    pub errors: mpsc::Receiver<WatchError>,
    pub suppress: SuppressFlag,
    pub root: PathBuf,
    pub guard: WatcherGuard,
}

/// A running filesystem watcher.
///
/// Construction registers every directory synchronously; once `new` returns,
/// every later change under the registered directories is observed.
#[derive(Debug)]
pub struct Watcher {
    events: mpsc::Receiver<WatchEvent>,
    errors: mpsc::Receiver<WatchError>,
    suppress: SuppressFlag,
    root: PathBuf,
    watched: Vec<PathBuf>,
    guard: WatcherGuard,
}

impl Watcher {
    /// Start watching according to `config`.
    ///
    /// Must be called from within a Tokio runtime: the filter loop runs as a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Fails if the root is not a directory, an exclude pattern is invalid,
    /// the OS notification primitive cannot be created, or any directory
    /// cannot be registered.
    pub fn new(config: WatchConfig) -> Result<Self> {
        Self::start(config, Arc::new(RealFileSystem))
    }

    fn start(config: WatchConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        if !fs.is_dir(&config.dir) {
            return Err(WatchrunError::ConfigError(format!(
                "watch root {:?} is not a directory",
                config.dir
            )));
        }
        // Canonicalize once so event paths and the file list agree.
        let root = fs
            .canonicalize(&config.dir)
            .unwrap_or_else(|_| config.dir.clone());

        let filter = EventFilter::new(root.clone(), &config)?;

        // Channel from the blocking notify callback into the async world.
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut inner = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // The receiver only goes away when the loop shuts down.
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )?;

        let dirs = if config.uses_file_list() {
            file_list_dirs(&root, &config.files)
        } else {
            let exclude = filter.exclude().cloned().unwrap_or_else(ExcludeSet::empty);
            collect_watch_dirs(fs.as_ref(), &root, &root, &exclude)?
        };

        for dir in &dirs {
            inner.watch(dir, RecursiveMode::NonRecursive)?;
            trace!(dir = ?dir, "registered directory");
        }

        info!(
            root = ?root,
            directories = dirs.len(),
            file_list = config.uses_file_list(),
            "file watcher ready"
        );

        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let suppress = SuppressFlag::default();

        let event_loop = EventLoop {
            inner,
            filter,
            fs,
            suppress: suppress.clone(),
            events_tx,
            errors_tx,
        };
        tokio::spawn(event_loop.run(raw_rx, shutdown_rx));

        Ok(Self {
            events: events_rx,
            errors: errors_rx,
            suppress,
            root,
            watched: dirs,
            guard: WatcherGuard {
                _shutdown: shutdown_tx,
            },
        })
    }

    /// Next qualifying event. `None` only once the watcher loop has stopped.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Next non-fatal error reported by the watcher.
    pub async fn next_error(&mut self) -> Option<WatchError> {
        self.errors.recv().await
    }

    pub fn suppress_flag(&self) -> SuppressFlag {
        self.suppress.clone()
    }

    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppress.set(suppressed);
    }

    /// Canonical watch root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories registered at construction time.
    pub fn watched_dirs(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn into_streams(self) -> WatchStreams {
        WatchStreams {
            events: self.events,
            errors: self.errors,
            suppress: self.suppress,
            root: self.root,
            guard: self.guard,
        }
    }
}

/// State owned by the coordinating loop: the only writer of the dedup map
/// and the only caller of `notify` after construction.
struct EventLoop {
    inner: RecommendedWatcher,
    filter: EventFilter,
    fs: Arc<dyn FileSystem>,
    suppress: SuppressFlag,
    events_tx: mpsc::Sender<WatchEvent>,
    errors_tx: mpsc::Sender<WatchError>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                raw = raw_rx.recv() => {
                    let keep_going = match raw {
                        Some(Ok(event)) => self.handle_event(event).await,
                        Some(Err(err)) => {
                            self.report(WatchError::Notify(err));
                            true
                        }
                        None => false,
                    };
                    if !keep_going {
                        break;
                    }
                }
            }
        }
        debug!(root = ?self.filter.root(), "watcher event loop finished");
    }

    /// Returns false once nobody listens for events any more.
    async fn handle_event(&mut self, event: Event) -> bool {
        let Some(op) = op_kind(&event.kind) else {
            trace!(kind = ?event.kind, "ignoring non-operation notification");
            return true;
        };

        for path in event.paths {
            let verdict = self.filter.apply(
                path,
                op,
                Instant::now(),
                self.suppress.is_set(),
                self.fs.as_ref(),
            );

            match verdict {
                Verdict::Forward(ev) => {
                    debug!(path = ?ev.path, op = %ev.op, "forwarding watch event");
                    if self.events_tx.send(ev).await.is_err() {
                        debug!("watch event receiver dropped; stopping watcher loop");
                        return false;
                    }
                }
                Verdict::RegisterDir(dir) => self.register_new_dir(&dir),
                Verdict::Drop(reason) => trace!(?reason, "dropped notification"),
                Verdict::Failed(err) => self.report(err),
            }
        }
        true
    }

    fn register_new_dir(&mut self, dir: &Path) {
        let exclude = self
            .filter
            .exclude()
            .cloned()
            .unwrap_or_else(ExcludeSet::empty);

        // The new directory may already contain subdirectories (mkdir -p,
        // moved-in trees); register them all.
        let dirs = match collect_watch_dirs(self.fs.as_ref(), self.filter.root(), dir, &exclude) {
            Ok(dirs) => dirs,
            Err(err) => {
                self.report(WatchError::Walk {
                    path: dir.to_path_buf(),
                    message: format!("{err:#}"),
                });
                return;
            }
        };

        for d in dirs {
            match self.inner.watch(&d, RecursiveMode::NonRecursive) {
                Ok(()) => debug!(dir = ?d, "registered new directory"),
                Err(source) => self.report(WatchError::Register { path: d, source }),
            }
        }
    }

    /// Errors are diagnostics: if the consumer lags, drop the newest.
    fn report(&self, err: WatchError) {
        match self.errors_tx.try_send(err) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(err)) => {
                warn!(error = %err, "watch error stream full; dropping error");
            }
            Err(mpsc::error::TrySendError::Closed(err)) => {
                debug!(error = %err, "watch error stream closed");
            }
        }
    }
}
