// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::model::{
    ConfigFile, RawConfigFile, TaskConfig, TaskSpec, WatcherConfig, WatcherSpec,
};
use crate::errors::{Result, WatchrunError};
use crate::exec::{DEFAULT_TIMEOUT, InterpreterTable, TaskOpts};
use crate::types::{OpKind, OutputMode, parse_duration};
use crate::watch::{DEFAULT_EVENT_CAPACITY, DEFAULT_EVENT_CUTOFF, WatchConfig};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::WatchrunError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;

        let interpreters = build_interpreters(&raw);

        let mut tasks = BTreeMap::new();
        for (name, task) in &raw.task {
            tasks.insert(name.clone(), build_task(name, task)?);
        }

        let mut watchers = Vec::with_capacity(raw.watcher.len());
        for (idx, watcher) in raw.watcher.iter().enumerate() {
            watchers.push(build_watcher(idx, watcher)?);
        }

        Ok(ConfigFile::new_unchecked(interpreters, tasks, watchers))
    }
}

/// Structural checks that need no conversion.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks_and_watchers(cfg)?;
    validate_tasks(cfg)?;
    validate_watchers(cfg)?;
    Ok(())
}

fn ensure_has_tasks_and_watchers(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(WatchrunError::ConfigError(
            "config must contain at least one [task.<name>] section".to_string(),
        ));
    }
    if cfg.watcher.is_empty() {
        return Err(WatchrunError::ConfigError(
            "config must contain at least one [[watcher]] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_tasks(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in &cfg.task {
        if task.cmd.trim().is_empty() {
            return Err(WatchrunError::ConfigError(format!(
                "task '{name}' has an empty `cmd`"
            )));
        }
        if !task.persistent {
            if task.delimiter.is_some() {
                return Err(WatchrunError::ConfigError(format!(
                    "task '{name}': `delimiter` only applies to persistent tasks"
                )));
            }
            if task.idle_grace.is_some() {
                return Err(WatchrunError::ConfigError(format!(
                    "task '{name}': `idle_grace` only applies to persistent tasks"
                )));
            }
        }
        if matches!(task.delimiter.as_deref(), Some("")) {
            return Err(WatchrunError::ConfigError(format!(
                "task '{name}': `delimiter` must not be empty"
            )));
        }
    }
    Ok(())
}

fn validate_watchers(cfg: &RawConfigFile) -> Result<()> {
    for (idx, watcher) in cfg.watcher.iter().enumerate() {
        let label = watcher_name(idx, watcher);

        if watcher.tasks.is_empty() {
            return Err(WatchrunError::ConfigError(format!(
                "watcher '{label}' does not trigger any tasks"
            )));
        }
        for task in &watcher.tasks {
            if !cfg.task.contains_key(task) {
                return Err(WatchrunError::TaskNotFound(format!(
                    "watcher '{label}' references unknown task '{task}'"
                )));
            }
        }

        if watcher.discover {
            if watcher.tasks.len() != 1 {
                return Err(WatchrunError::ConfigError(format!(
                    "watcher '{label}': discovery watchers run exactly one task (got {})",
                    watcher.tasks.len()
                )));
            }
            if cfg.task[&watcher.tasks[0]].persistent {
                return Err(WatchrunError::ConfigError(format!(
                    "watcher '{label}': discovery cannot use persistent task '{}'",
                    watcher.tasks[0]
                )));
            }
            if !watcher.files.is_empty() {
                return Err(WatchrunError::ConfigError(format!(
                    "watcher '{label}': discovery cannot be combined with `files`"
                )));
            }
        }

        if watcher.event_capacity == Some(0) {
            return Err(WatchrunError::ConfigError(format!(
                "watcher '{label}': event_capacity must be >= 1 (got 0)"
            )));
        }
    }
    Ok(())
}

fn watcher_name(idx: usize, watcher: &WatcherConfig) -> String {
    watcher
        .name
        .clone()
        .unwrap_or_else(|| format!("watcher-{idx}"))
}

fn build_interpreters(cfg: &RawConfigFile) -> InterpreterTable {
    match &cfg.interpreter {
        None => InterpreterTable::default(),
        Some(entries) => {
            let mut table = InterpreterTable::empty();
            for entry in entries {
                table.insert(&entry.ext, entry.prefix.iter().cloned());
            }
            table
        }
    }
}

fn duration_field(
    owner: &str,
    field: &str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(s) => parse_duration(s).map_err(|e| {
            WatchrunError::ConfigError(format!("{owner}: invalid `{field}` {s:?}: {e}"))
        }),
    }
}

fn build_task(name: &str, task: &TaskConfig) -> Result<TaskSpec> {
    let owner = format!("task '{name}'");
    let opts = TaskOpts {
        cmd: task.cmd.clone(),
        dir: task.dir.clone(),
        timeout: duration_field(&owner, "timeout", task.timeout.as_deref(), DEFAULT_TIMEOUT)?,
        output: task.output.unwrap_or(if task.persistent {
            OutputMode::Captured
        } else {
            OutputMode::Console
        }),
        clear_screen: task.clear_screen.unwrap_or(true),
        delimiter: task.delimiter.clone(),
        idle_grace: duration_field(
            &owner,
            "idle_grace",
            task.idle_grace.as_deref(),
            Duration::ZERO,
        )?,
    };
    Ok(TaskSpec {
        opts,
        persistent: task.persistent,
    })
}

fn build_watcher(idx: usize, watcher: &WatcherConfig) -> Result<WatcherSpec> {
    let name = watcher_name(idx, watcher);
    let owner = format!("watcher '{name}'");
    let config = WatchConfig {
        dir: watcher.dir.clone(),
        ext: watcher.ext.clone().filter(|e| !e.trim().is_empty()),
        files: watcher.files.clone(),
        exclude_dirs: watcher.exclude_dirs.clone(),
        ignore: watcher.ignore.clone().unwrap_or_else(|| vec![OpKind::Chmod]),
        event_cutoff: duration_field(
            &owner,
            "event_cutoff",
            watcher.event_cutoff.as_deref(),
            DEFAULT_EVENT_CUTOFF,
        )?,
        event_capacity: watcher.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY),
    };
    Ok(WatcherSpec {
        name,
        config,
        tasks: watcher.tasks.clone(),
        discover: watcher.discover,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(src)?;
        ConfigFile::try_from(raw)
    }

    #[test]
    fn full_config_is_converted() {
        let cfg = parse(
            r#"
            [[interpreter]]
            ext = "py"
            prefix = ["python3"]

            [task.lint]
            cmd = "eslint {{fileName}}"
            timeout = "30s"
            output = "captured"
            clear_screen = false

            [task.repl]
            cmd = "node repl.js"
            persistent = true
            delimiter = "__DONE__"

            [[watcher]]
            name = "web"
            dir = "web"
            ext = "js"
            exclude_dirs = ["node_modules", "tmp*"]
            ignore = ["chmod", "remove"]
            event_cutoff = "50ms"
            tasks = ["lint", "repl"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.interpreters().lookup(".py").unwrap(), ["python3"]);
        assert!(cfg.interpreters().lookup(".go").is_none());

        let lint = cfg.task("lint").unwrap();
        assert_eq!(lint.opts.timeout, Duration::from_secs(30));
        assert_eq!(lint.opts.output, OutputMode::Captured);
        assert!(!lint.opts.clear_screen);
        assert!(!lint.persistent);

        let repl = cfg.task("repl").unwrap();
        assert!(repl.persistent);
        assert_eq!(repl.opts.delimiter.as_deref(), Some("__DONE__"));
        assert_eq!(repl.opts.timeout, DEFAULT_TIMEOUT);
        assert_eq!(repl.opts.output, OutputMode::Captured);

        let web = &cfg.watchers()[0];
        assert_eq!(web.name, "web");
        assert_eq!(web.config.ignore, vec![OpKind::Chmod, OpKind::Remove]);
        assert_eq!(web.config.event_cutoff, Duration::from_millis(50));
        assert_eq!(web.tasks, vec!["lint", "repl"]);
    }

    #[test]
    fn defaults_apply() {
        let cfg = parse(
            r#"
            [task.t]
            cmd = "make"

            [[watcher]]
            tasks = ["t"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.interpreters(), &InterpreterTable::default());
        let w = &cfg.watchers()[0];
        assert_eq!(w.name, "watcher-0");
        assert_eq!(w.config.ignore, vec![OpKind::Chmod]);
        assert_eq!(w.config.event_cutoff, DEFAULT_EVENT_CUTOFF);
        assert!(cfg.task("t").unwrap().opts.clear_screen);
        assert_eq!(cfg.task("t").unwrap().opts.output, OutputMode::Console);
    }

    #[test]
    fn unknown_task_reference_is_rejected() {
        let err = parse(
            r#"
            [task.t]
            cmd = "make"

            [[watcher]]
            tasks = ["nope"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, WatchrunError::TaskNotFound(_)));
    }

    #[test]
    fn delimiter_requires_persistent_task() {
        let err = parse(
            r#"
            [task.t]
            cmd = "make"
            delimiter = "END"

            [[watcher]]
            tasks = ["t"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("delimiter"));
    }

    #[test]
    fn discovery_needs_exactly_one_single_run_task() {
        let err = parse(
            r#"
            [task.a]
            cmd = "go test"
            [task.b]
            cmd = "go vet"

            [[watcher]]
            discover = true
            tasks = ["a", "b"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, WatchrunError::ConfigError(_)));
    }

    #[test]
    fn bad_duration_and_zero_capacity_are_rejected() {
        let err = parse(
            r#"
            [task.t]
            cmd = "make"
            timeout = "soon"

            [[watcher]]
            tasks = ["t"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeout"));

        let err = parse(
            r#"
            [task.t]
            cmd = "make"

            [[watcher]]
            tasks = ["t"]
            event_capacity = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("event_capacity"));
    }

    #[test]
    fn missing_sections_are_rejected() {
        assert!(parse("").is_err());
        assert!(parse("[task.t]\ncmd = \"make\"\n").is_err());
    }
}
