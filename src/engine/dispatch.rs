// src/engine/dispatch.rs

use std::sync::Arc;

use tracing::{debug, warn};

use crate::exec::{RunReport, Task, TaskError, Trigger};
use crate::watch::{SuppressFlag, WatchEvent};

/// Result of one task's run for one event.
#[derive(Debug)]
pub struct TaskRun {
    pub task: String,
    pub report: Result<RunReport, TaskError>,
}

/// Hand `event` to every task and wait until all of them are done.
///
/// The watcher is suppressed for the whole duration, so files written by
/// the tasks do not trigger another round. Tasks run concurrently with each
/// other; each one still serializes its own triggers.
pub async fn dispatch_event(
    tasks: &[Arc<dyn Task>],
    suppress: &SuppressFlag,
    event: &WatchEvent,
) -> Vec<TaskRun> {
    suppress.set(true);

    let payload = event.payload();
    let mut pending = Vec::with_capacity(tasks.len());
    let mut runs = Vec::with_capacity(tasks.len());

    for task in tasks {
        let trigger = if task.wants_newline() {
            Trigger::new(format!("{payload}\n"))
        } else {
            Trigger::new(payload.clone())
        };
        match task.dispatch(trigger).await {
            Ok(completion) => pending.push((task.name().to_string(), completion)),
            Err(err) => runs.push(TaskRun {
                task: task.name().to_string(),
                report: Err(err),
            }),
        }
    }

    for (task, completion) in pending {
        let report = completion.wait().await;
        runs.push(TaskRun { task, report });
    }

    suppress.set(false);

    for run in &runs {
        match &run.report {
            Ok(report) => debug!(
                task = %run.task,
                outcome = ?report.outcome,
                elapsed = ?report.elapsed,
                "task run finished"
            ),
            Err(err) => warn!(task = %run.task, error = %err, "could not run task"),
        }
    }

    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{Completion, RunOutcome, TaskFuture};
    use crate::types::OpKind;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Completes immediately and records whether suppression was on while
    /// it ran.
    struct Probe {
        name: String,
        newline: bool,
        suppress: SuppressFlag,
        seen: Mutex<Vec<(String, bool)>>,
    }

    impl Task for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn dispatch(&self, trigger: Trigger) -> TaskFuture<'_, Completion> {
            self.seen
                .lock()
                .unwrap()
                .push((trigger.payload.clone(), self.suppress.is_set()));
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(RunReport {
                payload: trigger.payload,
                outcome: RunOutcome::Succeeded,
                stdout: None,
                stderr: None,
                elapsed: Duration::ZERO,
            });
            let completion = Completion::new(&self.name, rx);
            Box::pin(async move { Ok(completion) })
        }

        fn kill(&self) -> TaskFuture<'_, ()> {
            Box::pin(async { Err(TaskError::NoProcess) })
        }

        fn wants_newline(&self) -> bool {
            self.newline
        }
    }

    #[tokio::test]
    async fn every_task_sees_the_event_while_suppressed() {
        let suppress = SuppressFlag::default();
        let single = Arc::new(Probe {
            name: "single".into(),
            newline: false,
            suppress: suppress.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let persistent = Arc::new(Probe {
            name: "persistent".into(),
            newline: true,
            suppress: suppress.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let tasks: Vec<Arc<dyn Task>> = vec![single.clone(), persistent.clone()];

        let event = WatchEvent::new("/proj/a.js", OpKind::Write);
        let runs = dispatch_event(&tasks, &suppress, &event).await;

        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.report.is_ok()));
        assert!(!suppress.is_set());
        assert_eq!(
            single.seen.lock().unwrap().as_slice(),
            &[("/proj/a.js".to_string(), true)]
        );
        assert_eq!(
            persistent.seen.lock().unwrap().as_slice(),
            &[("/proj/a.js\n".to_string(), true)]
        );
    }
}
