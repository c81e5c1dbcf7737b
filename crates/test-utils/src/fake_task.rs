use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use watchrun::exec::{
    Completion, RunOutcome, RunPlan, RunReport, Task, TaskError, TaskFuture, TaskHooks, Trigger,
};

/// How a [`FakeTask`] run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOutcome {
    Succeed,
    TimeOut,
}

/// A task that never spawns anything:
/// - records every trigger it receives
/// - completes each one after an optional delay with a fixed outcome.
#[derive(Clone)]
pub struct FakeTask {
    name: String,
    triggers: Arc<Mutex<Vec<Trigger>>>,
    kills: Arc<AtomicUsize>,
    delay: Duration,
    outcome: FakeOutcome,
    newline: bool,
}

impl FakeTask {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            triggers: Arc::new(Mutex::new(Vec::new())),
            kills: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            outcome: FakeOutcome::Succeed,
            newline: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_outcome(mut self, outcome: FakeOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Behave like a persistent task and ask for newline-terminated payloads.
    pub fn line_based(mut self) -> Self {
        self.newline = true;
        self
    }

    pub fn payloads(&self) -> Vec<String> {
        self.triggers
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.payload.clone())
            .collect()
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        self.triggers.lock().unwrap().clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl Task for FakeTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, trigger: Trigger) -> TaskFuture<'_, Completion> {
        self.triggers.lock().unwrap().push(trigger.clone());

        let (tx, rx) = oneshot::channel();
        let delay = self.delay;
        let outcome = self.outcome;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(RunReport {
                payload: trigger.payload,
                outcome: match outcome {
                    FakeOutcome::Succeed => RunOutcome::Succeeded,
                    FakeOutcome::TimeOut => RunOutcome::TimedOut,
                },
                stdout: None,
                stderr: None,
                elapsed: delay,
            });
        });

        let completion = Completion::new(self.name.clone(), rx);
        Box::pin(async move { Ok(completion) })
    }

    fn kill(&self) -> TaskFuture<'_, ()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn wants_newline(&self) -> bool {
        self.newline
    }
}

/// Hooks that record the order in which they fire.
#[derive(Clone, Default)]
pub struct RecordingHooks {
    calls: Arc<Mutex<Vec<String>>>,
    skip: bool,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `before_run` sets `should_run = false`.
    pub fn skipping() -> Self {
        Self {
            skip: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl TaskHooks for RecordingHooks {
    fn before_run(&self, payload: &str, plan: &mut RunPlan) {
        self.record(format!("before_run:{payload}"));
        if self.skip {
            plan.should_run = false;
        }
    }

    fn on_success(&self) {
        self.record("on_success");
    }

    fn on_error(&self, err: &TaskError) {
        self.record(format!("on_error:{err}"));
    }

    fn on_timeout(&self) {
        self.record("on_timeout");
    }

    fn on_done(&self) {
        self.record("on_done");
    }
}
