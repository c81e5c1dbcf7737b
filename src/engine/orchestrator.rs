// src/engine/orchestrator.rs

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::discovery::DiscoveryRunner;
use crate::engine::dispatch::dispatch_event;
use crate::errors::Result;
use crate::exec::{PersistentStreams, Task};
use crate::watch::{WatchError, WatchStreams};

enum Target {
    FanOut(Vec<Arc<dyn Task>>),
    Discovery(DiscoveryRunner),
}

struct Binding {
    name: String,
    streams: WatchStreams,
    target: Target,
}

/// Drives every watcher binding until shutdown.
///
/// Each binding gets its own loop: watchers never wait on each other, and
/// within one binding events are handled strictly in order.
#[derive(Default)]
pub struct Orchestrator {
    bindings: Vec<Binding>,
    outputs: Vec<(String, PersistentStreams)>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.bindings.iter().map(|b| b.name.as_str()).collect();
        f.debug_struct("Orchestrator")
            .field("bindings", &names)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every task in `tasks` for each event of the watcher.
    pub fn bind(
        &mut self,
        name: impl Into<String>,
        streams: WatchStreams,
        tasks: Vec<Arc<dyn Task>>,
    ) {
        self.bindings.push(Binding {
            name: name.into(),
            streams,
            target: Target::FanOut(tasks),
        });
    }

    /// Run the discovery runner's task across all eligible directories for
    /// each event of the watcher.
    pub fn bind_discovery(
        &mut self,
        name: impl Into<String>,
        streams: WatchStreams,
        runner: DiscoveryRunner,
    ) {
        self.bindings.push(Binding {
            name: name.into(),
            streams,
            target: Target::Discovery(runner),
        });
    }

    /// Print a persistent task's responses while the orchestrator runs.
    pub fn forward_output(&mut self, task: impl Into<String>, streams: PersistentStreams) {
        self.outputs.push((task.into(), streams));
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Run until `shutdown` resolves or every watcher has stopped.
    pub async fn run<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        info!(bindings = self.bindings.len(), "watchrun orchestrator started");

        let mut loops = JoinSet::new();
        for binding in self.bindings {
            loops.spawn(run_binding(binding));
        }

        let mut printers = JoinSet::new();
        for (task, streams) in self.outputs {
            printers.spawn(print_responses(task, streams));
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping watchers");
                    break;
                }
                joined = loops.join_next() => match joined {
                    Some(Ok(name)) => debug!(watcher = %name, "watcher loop finished"),
                    Some(Err(err)) => warn!(error = %err, "watcher loop aborted"),
                    None => {
                        info!("all watchers stopped");
                        break;
                    }
                },
            }
        }

        loops.shutdown().await;
        printers.shutdown().await;
        info!("orchestrator exiting");
        Ok(())
    }
}

async fn run_binding(binding: Binding) -> String {
    let Binding {
        name,
        streams,
        mut target,
    } = binding;
    let WatchStreams {
        mut events,
        mut errors,
        suppress,
        root,
        guard: _guard,
    } = streams;

    debug!(watcher = %name, root = ?root, "watcher loop started");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                debug!(watcher = %name, path = ?event.path, op = %event.op, "dispatching event");
                match &mut target {
                    Target::FanOut(tasks) => {
                        dispatch_event(tasks, &suppress, &event).await;
                    }
                    Target::Discovery(runner) => {
                        runner.handle(&event, &suppress).await;
                    }
                }
            }
            Some(err) = errors.recv() => log_watch_error(&name, &err),
        }
    }

    name
}

fn log_watch_error(watcher: &str, err: &WatchError) {
    warn!(watcher, error = %err, "watcher error");
}

async fn print_responses(task: String, streams: PersistentStreams) {
    let PersistentStreams {
        mut outputs,
        mut errors,
    } = streams;
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            out = outputs.recv(), if out_open => match out {
                Some(text) => println!("{text}"),
                None => out_open = false,
            },
            err = errors.recv(), if err_open => match err {
                Some(text) => {
                    warn!(task = %task, response = %text, "persistent task reported an error")
                }
                None => err_open = false,
            },
        }
    }
    debug!(task = %task, "persistent task output closed");
}

/// Channel-backed shutdown signal, for callers that trigger shutdown from
/// somewhere other than Ctrl-C.
pub fn shutdown_channel() -> (mpsc::Sender<()>, impl Future<Output = ()>) {
    let (tx, mut rx) = mpsc::channel::<()>(1);
    (tx, async move {
        let _ = rx.recv().await;
    })
}
