// src/exec/single.rs

//! One process per trigger.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::exec::command::{CommandTemplate, InterpreterTable};
use crate::exec::hooks::{RunPlan, TaskHooks};
use crate::exec::{
    Completion, RunOutcome, RunReport, Task, TaskError, TaskFuture, TaskOpts, Trigger,
    clear_screen,
};
use crate::types::OutputMode;

/// Observable state of a [`SingleTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Errored,
    TimedOut,
    Skipped,
}

type KillReply = oneshot::Sender<Result<(), TaskError>>;

struct Request {
    trigger: Trigger,
    done: oneshot::Sender<RunReport>,
    // Held until the run has fully finished; releases the next trigger.
    _permit: OwnedSemaphorePermit,
}

/// Runs its command once per trigger, strictly one run at a time.
///
/// A trigger that arrives while a run is in flight waits in
/// [`SingleTask::trigger`] until that run has completed. Timed-out processes
/// are not killed; they stay parked until [`SingleTask::kill`] or the next
/// run.
pub struct SingleTask {
    name: String,
    requests: mpsc::Sender<Request>,
    kills: mpsc::Sender<KillReply>,
    gate: Arc<Semaphore>,
    should_run: Arc<AtomicBool>,
    state: watch::Receiver<RunState>,
}

impl SingleTask {
    /// Spawn the task's loop. Must be called inside a Tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        opts: TaskOpts,
        interpreters: InterpreterTable,
        hooks: Arc<dyn TaskHooks>,
    ) -> Self {
        let name = name.into();
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (kills_tx, kills_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        let should_run = Arc::new(AtomicBool::new(true));

        let runner = Runner {
            name: name.clone(),
            template: CommandTemplate::new(opts.cmd.clone()),
            opts,
            interpreters,
            hooks,
            should_run: Arc::clone(&should_run),
            state: state_tx,
            parked: None,
        };
        tokio::spawn(runner.run(requests_rx, kills_rx));

        Self {
            name,
            requests: requests_tx,
            kills: kills_tx,
            gate: Arc::new(Semaphore::new(1)),
            should_run,
            state: state_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a run for `payload`. See [`SingleTask::trigger_with`].
    pub async fn trigger(&self, payload: impl Into<String>) -> Result<Completion, TaskError> {
        self.trigger_with(Trigger::new(payload)).await
    }

    /// Queue a run. Waits while a previous run is still in flight.
    pub async fn trigger_with(&self, trigger: Trigger) -> Result<Completion, TaskError> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::Closed(self.name.clone()))?;

        let (done_tx, done_rx) = oneshot::channel();
        self.requests
            .send(Request {
                trigger,
                done: done_tx,
                _permit: permit,
            })
            .await
            .map_err(|_| TaskError::Closed(self.name.clone()))?;

        Ok(Completion::new(&self.name, done_rx))
    }

    /// Trigger and wait for the run to finish.
    pub async fn run(&self, payload: impl Into<String>) -> Result<RunReport, TaskError> {
        self.trigger(payload).await?.wait().await
    }

    /// Kill the current process: the running one, or the one left behind by
    /// a timed-out run. Fails with [`TaskError::NoProcess`] if there is none.
    pub async fn kill(&self) -> Result<(), TaskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.kills
            .send(reply_tx)
            .await
            .map_err(|_| TaskError::Closed(self.name.clone()))?;
        reply_rx
            .await
            .map_err(|_| TaskError::Closed(self.name.clone()))?
    }

    pub fn set_should_run(&self, should_run: bool) {
        self.should_run.store(should_run, Ordering::SeqCst);
    }

    pub fn should_run(&self) -> bool {
        self.should_run.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }
}

impl Task for SingleTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, trigger: Trigger) -> TaskFuture<'_, Completion> {
        Box::pin(self.trigger_with(trigger))
    }

    fn kill(&self) -> TaskFuture<'_, ()> {
        Box::pin(SingleTask::kill(self))
    }
}

/// The task's loop: owns the child process handles.
struct Runner {
    name: String,
    template: CommandTemplate,
    opts: TaskOpts,
    interpreters: InterpreterTable,
    hooks: Arc<dyn TaskHooks>,
    should_run: Arc<AtomicBool>,
    state: watch::Sender<RunState>,
    /// Process left behind by a timed-out run.
    parked: Option<Child>,
}

struct Captured {
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl Runner {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut kills: mpsc::Receiver<KillReply>,
    ) {
        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => self.handle(req, &mut kills).await,
                    None => break,
                },
                Some(reply) = kills.recv() => {
                    let _ = reply.send(self.kill_parked().await);
                }
            }
        }
        debug!(task = %self.name, "task loop finished");
    }

    async fn handle(&mut self, req: Request, kills: &mut mpsc::Receiver<KillReply>) {
        let started = Instant::now();
        let Request {
            trigger,
            done,
            _permit,
        } = req;
        self.state.send_replace(RunState::Running);

        let (outcome, stdout, stderr) = match self.plan(&trigger) {
            Some(mut plan) => {
                self.hooks.before_run(&trigger.payload, &mut plan);
                if !plan.should_run || !self.should_run.load(Ordering::SeqCst) {
                    debug!(task = %self.name, payload = %trigger.payload, "run skipped");
                    (RunOutcome::Skipped, None, None)
                } else {
                    self.execute(plan, kills).await
                }
            }
            None => (RunOutcome::Errored(TaskError::EmptyCommand), None, None),
        };

        let state = match &outcome {
            RunOutcome::Succeeded => {
                self.hooks.on_success();
                RunState::Succeeded
            }
            RunOutcome::Errored(err) => {
                self.hooks.on_error(err);
                RunState::Errored
            }
            RunOutcome::TimedOut => {
                self.hooks.on_timeout();
                RunState::TimedOut
            }
            RunOutcome::Skipped => RunState::Skipped,
        };
        self.state.send_replace(state);
        self.hooks.on_done();
        self.state.send_replace(RunState::Idle);

        let _ = done.send(RunReport {
            payload: trigger.payload,
            outcome,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        });
    }

    /// Build the command for this trigger. The trigger's directory wins over
    /// the task's.
    fn plan(&self, trigger: &Trigger) -> Option<RunPlan> {
        let resolved = self
            .template
            .resolve(Some(&trigger.payload), &self.interpreters)?;
        Some(RunPlan {
            program: resolved.program,
            args: resolved.args,
            dir: trigger.dir.clone().or_else(|| self.opts.dir.clone()),
            should_run: true,
        })
    }

    async fn execute(
        &mut self,
        plan: RunPlan,
        kills: &mut mpsc::Receiver<KillReply>,
    ) -> (RunOutcome, Option<String>, Option<String>) {
        if plan.program.is_empty() {
            return (RunOutcome::Errored(TaskError::EmptyCommand), None, None);
        }

        if self.opts.clear_screen {
            clear_screen();
        }

        // A new run replaces whatever a previous timeout left behind.
        if let Some(mut old) = self.parked.take() {
            if let Ok(None) = old.try_wait() {
                warn!(
                    task = %self.name,
                    pid = ?old.id(),
                    "previous timed-out process is still running; no longer tracking it"
                );
            }
        }

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args).kill_on_drop(false);
        if let Some(dir) = &plan.dir {
            cmd.current_dir(dir);
        }
        match self.opts.output {
            OutputMode::Console => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            OutputMode::Captured => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = TaskError::Spawn {
                    program: plan.program,
                    source,
                };
                return (RunOutcome::Errored(err), None, None);
            }
        };

        info!(
            task = %self.name,
            pid = ?child.id(),
            program = %plan.program,
            "starting task process"
        );

        let captured = Captured {
            stdout: child.stdout.take().map(|out| tokio::spawn(read_all(out))),
            stderr: child.stderr.take().map(|err| tokio::spawn(read_all(err))),
        };

        let deadline = tokio::time::sleep(self.opts.timeout);
        tokio::pin!(deadline);
        let mut killed = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut deadline => {
                    info!(
                        task = %self.name,
                        pid = ?child.id(),
                        timeout = ?self.opts.timeout,
                        "task timed out; leaving process running"
                    );
                    self.parked = Some(child);
                    // Readers stay detached; the output of a timed-out run is
                    // not reported.
                    return (RunOutcome::TimedOut, None, None);
                }
                Some(reply) = kills.recv() => {
                    match child.kill().await {
                        Ok(()) => {
                            killed = true;
                            let _ = reply.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = reply.send(Err(TaskError::Kill(err)));
                        }
                    }
                }
            }
        };

        // A background process can inherit the pipes and keep them open long
        // after the child itself exited; the deadline covers the readers too.
        let (stdout, stderr) = tokio::select! {
            out = async {
                (join_output(captured.stdout).await, join_output(captured.stderr).await)
            } => out,
            _ = &mut deadline => {
                warn!(
                    task = %self.name,
                    timeout = ?self.opts.timeout,
                    "process exited but its output is still open; not waiting for it"
                );
                (None, None)
            }
        };

        let outcome = match status {
            _ if killed => RunOutcome::Errored(TaskError::Killed),
            Ok(status) if status.success() => RunOutcome::Succeeded,
            Ok(status) => RunOutcome::Errored(TaskError::Exit(status)),
            Err(err) => RunOutcome::Errored(TaskError::Wait(err)),
        };

        info!(
            task = %self.name,
            success = outcome.is_success(),
            "task process exited"
        );

        (outcome, stdout, stderr)
    }

    async fn kill_parked(&mut self) -> Result<(), TaskError> {
        let Some(mut child) = self.parked.take() else {
            return Err(TaskError::NoProcess);
        };
        match child.kill().await {
            Ok(()) => {
                info!(task = %self.name, "killed timed-out process");
                Ok(())
            }
            Err(err) => {
                // Already exited counts as nothing to kill.
                if let Ok(Some(_)) = child.try_wait() {
                    return Err(TaskError::NoProcess);
                }
                self.parked = Some(child);
                Err(TaskError::Kill(err))
            }
        }
    }
}

async fn read_all<R>(mut reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Err(err) = reader.read_to_end(&mut buf).await {
        debug!(error = %err, "stopped reading captured output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn join_output(handle: Option<JoinHandle<String>>) -> Option<String> {
    match handle {
        Some(handle) => handle.await.ok(),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::NoHooks;
    use std::time::Duration;

    fn captured(cmd: &str) -> TaskOpts {
        TaskOpts {
            output: OutputMode::Captured,
            clear_screen: false,
            ..TaskOpts::new(cmd)
        }
    }

    #[tokio::test]
    async fn captures_output_with_substituted_payload() {
        let task = SingleTask::spawn(
            "echo",
            captured("echo {{fileName}}"),
            InterpreterTable::default(),
            Arc::new(NoHooks),
        );

        let report = task.run("foo.txt").await.unwrap();
        assert!(report.outcome.is_success());
        assert_eq!(report.stdout.as_deref(), Some("foo.txt\n"));
        assert_eq!(task.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let task = SingleTask::spawn(
            "false",
            captured("false"),
            InterpreterTable::default(),
            Arc::new(NoHooks),
        );

        let report = task.run("x").await.unwrap();
        assert!(matches!(
            report.outcome,
            RunOutcome::Errored(TaskError::Exit(_))
        ));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let task = SingleTask::spawn(
            "missing",
            captured("definitely-not-a-real-binary-3141"),
            InterpreterTable::default(),
            Arc::new(NoHooks),
        );

        let report = task.run("x").await.unwrap();
        assert!(matches!(
            report.outcome,
            RunOutcome::Errored(TaskError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn kill_without_process_fails() {
        let task = SingleTask::spawn(
            "idle",
            captured("true"),
            InterpreterTable::default(),
            Arc::new(NoHooks),
        );
        assert!(matches!(task.kill().await, Err(TaskError::NoProcess)));
    }

    #[tokio::test]
    async fn should_run_false_skips_spawning() {
        let task = SingleTask::spawn(
            "skip",
            captured("echo hi"),
            InterpreterTable::default(),
            Arc::new(NoHooks),
        );
        task.set_should_run(false);

        let report = task.run("x").await.unwrap();
        assert!(matches!(report.outcome, RunOutcome::Skipped));
        assert!(report.stdout.is_none());
    }

    #[tokio::test]
    async fn timeout_leaves_process_until_killed() {
        let opts = TaskOpts {
            timeout: Duration::from_millis(100),
            ..captured("sleep 5")
        };
        let task =
            SingleTask::spawn("sleepy", opts, InterpreterTable::default(), Arc::new(NoHooks));

        let report = task.run("x").await.unwrap();
        assert!(matches!(report.outcome, RunOutcome::TimedOut));
        assert!(report.elapsed < Duration::from_secs(5));

        task.kill().await.unwrap();
        assert!(matches!(task.kill().await, Err(TaskError::NoProcess)));
    }
}
