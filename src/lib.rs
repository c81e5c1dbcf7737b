// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod types;
pub mod watch;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, load_and_validate};
use crate::engine::{DiscoveryRunner, Orchestrator};
use crate::exec::{LogHooks, PersistentTask, SingleTask, Task};
use crate::watch::Watcher;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - one task instance per configured task
/// - one watcher per `[[watcher]]`
/// - the orchestrator and Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = args.config.clone();
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading config {:?}", config_path))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let orchestrator = build_orchestrator(&cfg)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    orchestrator.run(shutdown).await?;
    Ok(())
}

/// Start every task and watcher named by `cfg` and bind them together.
///
/// Must be called inside a Tokio runtime.
pub fn build_orchestrator(cfg: &ConfigFile) -> Result<Orchestrator> {
    let mut orchestrator = Orchestrator::new();
    let tasks = start_tasks(cfg, &mut orchestrator)?;

    for spec in cfg.watchers() {
        let watcher = Watcher::new(spec.config.clone())
            .with_context(|| format!("starting watcher '{}'", spec.name))?;
        let root = watcher.root().to_path_buf();
        let streams = watcher.into_streams();

        let bound: Vec<Arc<dyn Task>> = spec
            .tasks
            .iter()
            .filter_map(|name| tasks.get(name).cloned())
            .collect();

        if spec.discover {
            let Some(task) = bound.into_iter().next() else {
                anyhow::bail!("watcher '{}' has no task to run", spec.name);
            };
            let runner = DiscoveryRunner::new(task, root, &spec.config)
                .with_context(|| format!("discovering directories for '{}'", spec.name))?;
            info!(
                watcher = %spec.name,
                dirs = runner.eligible_dirs().len(),
                "discovery watcher ready"
            );
            orchestrator.bind_discovery(spec.name.clone(), streams, runner);
        } else {
            orchestrator.bind(spec.name.clone(), streams, bound);
        }
    }

    Ok(orchestrator)
}

/// Spawn one instance per task referenced by at least one watcher.
fn start_tasks(
    cfg: &ConfigFile,
    orchestrator: &mut Orchestrator,
) -> Result<BTreeMap<String, Arc<dyn Task>>> {
    let mut tasks: BTreeMap<String, Arc<dyn Task>> = BTreeMap::new();

    for (name, spec) in cfg.tasks() {
        let referenced = cfg.watchers().iter().any(|w| w.tasks.contains(name));
        if !referenced {
            warn!(task = %name, "task is not referenced by any watcher; not starting it");
            continue;
        }

        let task: Arc<dyn Task> = if spec.persistent {
            let (task, streams) =
                PersistentTask::spawn(name.clone(), spec.opts.clone(), cfg.interpreters())
                    .with_context(|| format!("starting persistent task '{name}'"))?;
            orchestrator.forward_output(name.clone(), streams);
            Arc::new(task)
        } else {
            Arc::new(SingleTask::spawn(
                name.clone(),
                spec.opts.clone(),
                cfg.interpreters().clone(),
                Arc::new(LogHooks::new(name.clone())),
            ))
        };
        debug!(task = %name, persistent = spec.persistent, "task started");
        tasks.insert(name.clone(), task);
    }

    Ok(tasks)
}

/// Simple dry-run output: print watchers, tasks and commands.
fn print_dry_run(cfg: &ConfigFile) {
    println!("watchrun dry-run");
    println!();

    println!("watchers ({}):", cfg.watchers().len());
    for w in cfg.watchers() {
        println!("  - {}", w.name);
        println!("      dir: {}", w.config.dir.display());
        if let Some(ext) = &w.config.ext {
            println!("      ext: {ext}");
        }
        if !w.config.files.is_empty() {
            println!("      files: {:?}", w.config.files);
        }
        if !w.config.exclude_dirs.is_empty() {
            println!("      exclude_dirs: {:?}", w.config.exclude_dirs);
        }
        let ignore: Vec<_> = w.config.ignore.iter().map(|op| op.as_str()).collect();
        println!("      ignore: {ignore:?}");
        println!("      event_cutoff: {:?}", w.config.event_cutoff);
        println!("      tasks: {:?}", w.tasks);
        if w.discover {
            println!("      discover: true");
        }
    }
    println!();

    println!("tasks ({}):", cfg.tasks().len());
    for (name, spec) in cfg.tasks() {
        println!("  - {name}");
        println!("      cmd: {}", spec.opts.cmd);
        if let Some(dir) = &spec.opts.dir {
            println!("      dir: {}", dir.display());
        }
        println!("      timeout: {:?}", spec.opts.timeout);
        println!("      output: {:?}", spec.opts.output);
        if spec.persistent {
            println!("      persistent: true");
            if let Some(delim) = &spec.opts.delimiter {
                println!("      delimiter: {delim}");
            }
        }
    }

    debug!("dry-run complete (no execution)");
}
