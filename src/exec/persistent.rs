// src/exec/persistent.rs

//! One long-lived process that receives triggers on stdin.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::exec::command::{CommandTemplate, InterpreterTable};
use crate::exec::reader::{Framing, StreamReader};
use crate::exec::{
    Completion, RunOutcome, RunReport, Task, TaskError, TaskFuture, TaskOpts, Trigger,
    clear_screen,
};
use crate::types::OutputMode;

/// Capacity of the response channels handed out by [`PersistentTask::spawn`].
pub const RESPONSE_CAPACITY: usize = 16;

type KillReply = oneshot::Sender<Result<(), TaskError>>;

struct Request {
    payload: String,
    done: oneshot::Sender<RunReport>,
    _permit: OwnedSemaphorePermit,
}

/// Responses of a [`PersistentTask`], split by the stream they arrived on.
#[derive(Debug)]
pub struct PersistentStreams {
    /// Responses written to stdout.
    pub outputs: mpsc::Receiver<String>,
    /// Responses written to stderr.
    pub errors: mpsc::Receiver<String>,
}

/// Handle to a long-lived process.
///
/// Each trigger's payload is written verbatim to the process's stdin; the
/// first response on stdout or stderr answers it. Triggers are strictly
/// serialized.
///
/// A response that arrives after its trigger timed out is still delivered on
/// [`PersistentStreams`], but is never reported as the answer to the next
/// trigger: the runner skips one response for every timed-out trigger.
///
/// With [`OutputMode::Console`] the process writes straight to the terminal;
/// a trigger completes as soon as it has been written, and the response
/// channels stay empty.
pub struct PersistentTask {
    name: String,
    pid: Option<u32>,
    requests: mpsc::Sender<Request>,
    kills: mpsc::Sender<KillReply>,
    gate: Arc<Semaphore>,
}

impl PersistentTask {
    /// Start the process. Its command is the template with placeholders
    /// removed; triggers never change it.
    pub fn spawn(
        name: impl Into<String>,
        opts: TaskOpts,
        interpreters: &InterpreterTable,
    ) -> Result<(Self, PersistentStreams), TaskError> {
        let name = name.into();
        let resolved = CommandTemplate::new(opts.cmd.clone())
            .resolve(None, interpreters)
            .ok_or(TaskError::EmptyCommand)?;

        let mut cmd = Command::new(&resolved.program);
        cmd.args(&resolved.args).stdin(Stdio::piped()).kill_on_drop(true);
        match opts.output {
            OutputMode::Console => cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit()),
            OutputMode::Captured => cmd.stdout(Stdio::piped()).stderr(Stdio::piped()),
        };
        if let Some(dir) = &opts.dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| TaskError::Spawn {
            program: resolved.program.clone(),
            source,
        })?;
        let pid = child.id();

        let Some(stdin) = child.stdin.take() else {
            return Err(TaskError::Spawn {
                program: resolved.program,
                source: io::Error::other("child stdin unavailable"),
            });
        };

        info!(task = %name, pid = ?pid, program = %resolved.program, "started persistent process");

        let framing = match &opts.delimiter {
            Some(delim) => Framing::Delimited(delim.clone()),
            None => Framing::DrainUntilIdle {
                idle_grace: opts.idle_grace,
            },
        };

        let (outputs_tx, outputs_rx) = mpsc::channel(RESPONSE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(RESPONSE_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (kills_tx, kills_rx) = mpsc::channel(4);

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let runner = Runner {
            name: name.clone(),
            opts,
            child,
            stdin,
            stdout: child_stdout.map(|out| StreamReader::new(out, framing.clone())),
            stderr: child_stderr.map(|err| StreamReader::new(err, framing)),
            outputs: outputs_tx,
            errors: errors_tx,
            killed: false,
            late: 0,
        };
        tokio::spawn(runner.run(requests_rx, kills_rx));

        let task = Self {
            name,
            pid,
            requests: requests_tx,
            kills: kills_tx,
            gate: Arc::new(Semaphore::new(1)),
        };
        let streams = PersistentStreams {
            outputs: outputs_rx,
            errors: errors_rx,
        };
        Ok((task, streams))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the platform reported one.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Write `payload` to the process. Waits while a previous trigger is
    /// still waiting for its response.
    pub async fn trigger(&self, payload: impl Into<String>) -> Result<Completion, TaskError> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::Closed(self.name.clone()))?;

        let (done_tx, done_rx) = oneshot::channel();
        self.requests
            .send(Request {
                payload: payload.into(),
                done: done_tx,
                _permit: permit,
            })
            .await
            .map_err(|_| TaskError::Closed(self.name.clone()))?;

        Ok(Completion::new(&self.name, done_rx))
    }

    /// Trigger and wait for the response.
    pub async fn send(&self, payload: impl Into<String>) -> Result<RunReport, TaskError> {
        self.trigger(payload).await?.wait().await
    }

    /// Kill the process. Later triggers fail with
    /// [`TaskError::ProcessExited`].
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
}

impl Task for PersistentTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, trigger: Trigger) -> TaskFuture<'_, Completion> {
        Box::pin(self.trigger(trigger.payload))
    }

    fn kill(&self) -> TaskFuture<'_, ()> {
        Box::pin(PersistentTask::kill(self))
    }

    fn wants_newline(&self) -> bool {
        true
    }
}

/// Which stream answered a trigger.
enum Response {
    Stdout(String),
    Stderr(String),
}

struct Runner {
    name: String,
    opts: TaskOpts,
    child: Child,
    stdin: ChildStdin,
    /// `None` in console mode.
    stdout: Option<StreamReader<ChildStdout>>,
    stderr: Option<StreamReader<ChildStderr>>,
    outputs: mpsc::Sender<String>,
    errors: mpsc::Sender<String>,
    killed: bool,
    /// Responses still owed to triggers that timed out.
    late: usize,
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
                    let _ = reply.send(self.kill().await);
                }
            }
        }
        debug!(task = %self.name, "persistent task loop finished");
    }

    async fn handle(&mut self, req: Request, kills: &mut mpsc::Receiver<KillReply>) {
        let started = Instant::now();
        let Request {
            payload,
            done,
            _permit,
        } = req;

        if self.opts.clear_screen {
            clear_screen();
        }

        let (outcome, stdout, stderr) = match self.write(&payload).await {
            Err(err) => (RunOutcome::Errored(err), None, None),
            Ok(()) if self.opts.output == OutputMode::Console => {
                (RunOutcome::Succeeded, None, None)
            }
            Ok(()) => match self.await_response(kills).await {
                Ok(Some(Response::Stdout(text))) => {
                    self.deliver(Response::Stdout(text.clone())).await;
                    (RunOutcome::Succeeded, Some(text), None)
                }
                Ok(Some(Response::Stderr(text))) => {
                    self.deliver(Response::Stderr(text.clone())).await;
                    (
                        RunOutcome::Errored(TaskError::ErrorOutput(text.clone())),
                        None,
                        Some(text),
                    )
                }
                Ok(None) => {
                    warn!(
                        task = %self.name,
                        timeout = ?self.opts.timeout,
                        "no response from persistent process before timeout"
                    );
                    (RunOutcome::TimedOut, None, None)
                }
                Err(err) => (RunOutcome::Errored(err), None, None),
            },
        };

        let _ = done.send(RunReport {
            payload,
            outcome,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        });
    }

    async fn write(&mut self, payload: &str) -> Result<(), TaskError> {
        if self.killed {
            return Err(TaskError::ProcessExited);
        }
        self.stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(TaskError::Stdin)?;
        self.stdin.flush().await.map_err(TaskError::Stdin)
    }

    /// Hand a response to whoever consumes the task's streams.
    async fn deliver(&self, response: Response) {
        let _ = match response {
            Response::Stdout(text) => self.outputs.send(text).await,
            Response::Stderr(text) => self.errors.send(text).await,
        };
    }

    /// Race both streams for the first response. `Ok(None)` on timeout.
    async fn await_response(
        &mut self,
        kills: &mut mpsc::Receiver<KillReply>,
    ) -> Result<Option<Response>, TaskError> {
        let deadline = tokio::time::sleep(self.opts.timeout);
        tokio::pin!(deadline);

        loop {
            let out_open = is_open(&self.stdout);
            let err_open = is_open(&self.stderr);
            if !out_open && !err_open {
                return Err(if self.killed {
                    TaskError::Killed
                } else {
                    TaskError::ProcessExited
                });
            }

            let response = tokio::select! {
                res = next_response(&mut self.stdout), if out_open => match res {
                    Ok(Some(text)) => Response::Stdout(text),
                    Ok(None) => {
                        debug!(task = %self.name, "stdout closed");
                        continue;
                    }
                    Err(err) => return Err(TaskError::Read(err)),
                },
                res = next_response(&mut self.stderr), if err_open => match res {
                    Ok(Some(text)) => Response::Stderr(text),
                    Ok(None) => {
                        debug!(task = %self.name, "stderr closed");
                        continue;
                    }
                    Err(err) => return Err(TaskError::Read(err)),
                },
                _ = &mut deadline => {
                    self.late += 1;
                    return Ok(None);
                }
                Some(reply) = kills.recv() => {
                    let _ = reply.send(self.kill().await);
                    continue;
                }
            };

            if self.late > 0 {
                self.late -= 1;
                debug!(task = %self.name, "skipping response to a timed-out trigger");
                self.deliver(response).await;
                continue;
            }
            return Ok(Some(response));
        }
    }

    async fn kill(&mut self) -> Result<(), TaskError> {
        if self.killed {
            return Err(TaskError::NoProcess);
        }
        match self.child.kill().await {
            Ok(()) => {
                self.killed = true;
                info!(task = %self.name, "killed persistent process");
                Ok(())
            }
            Err(err) => {
                if let Ok(Some(_)) = self.child.try_wait() {
                    self.killed = true;
                    return Err(TaskError::NoProcess);
                }
                Err(TaskError::Kill(err))
            }
        }
    }
}

fn is_open<R: AsyncRead + Unpin>(reader: &Option<StreamReader<R>>) -> bool {
    reader.as_ref().is_some_and(|r| !r.is_closed())
}

async fn next_response<R: AsyncRead + Unpin>(
    reader: &mut Option<StreamReader<R>>,
) -> io::Result<Option<String>> {
    match reader {
        Some(reader) => reader.read_response().await,
        None => Ok(None),
    }
}
