// tests/persistent_task.rs

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use watchrun::exec::{InterpreterTable, PersistentTask, RunOutcome, TaskError, TaskOpts};
use watchrun::types::OutputMode;
use watchrun_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

/// Write `body` to a script file; commands are split on whitespace, so
/// anything non-trivial has to live in a file.
fn script(dir: &TempDir, body: &str) -> std::io::Result<PathBuf> {
    let path = dir.path().join("worker.sh");
    std::fs::write(&path, body)?;
    Ok(path)
}

fn opts(cmd: String) -> TaskOpts {
    TaskOpts {
        clear_screen: false,
        timeout: Duration::from_secs(3),
        output: OutputMode::Captured,
        ..TaskOpts::new(cmd)
    }
}

#[tokio::test]
async fn delimiter_ends_the_response() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = script(
        &dir,
        "while IFS= read -r line; do\n  printf 'foo__DONE__\\n'\n  printf 'bar\\n'\ndone\n",
    )?;
    let task_opts = TaskOpts {
        delimiter: Some("__DONE__".to_string()),
        ..opts(format!("sh {}", path.display()))
    };

    let (task, mut streams) =
        PersistentTask::spawn("worker", task_opts, &InterpreterTable::default())?;

    let report = with_timeout(task.send("a.txt\n")).await?;
    assert!(report.outcome.is_success());
    assert_eq!(report.stdout.as_deref(), Some("foo"));
    assert_eq!(with_timeout(streams.outputs.recv()).await.as_deref(), Some("foo"));
    Ok(())
}

#[tokio::test]
async fn stderr_response_goes_to_the_error_channel() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = script(&dir, "while IFS= read -r line; do\n  echo \"oops $line\" >&2\ndone\n")?;

    let (task, mut streams) = PersistentTask::spawn(
        "worker",
        opts(format!("sh {}", path.display())),
        &InterpreterTable::default(),
    )?;

    let report = with_timeout(task.send("a.txt\n")).await?;
    assert!(matches!(
        report.outcome,
        RunOutcome::Errored(TaskError::ErrorOutput(ref text)) if text == "oops a.txt"
    ));
    assert_eq!(
        with_timeout(streams.errors.recv()).await.as_deref(),
        Some("oops a.txt")
    );
    Ok(())
}

#[tokio::test]
async fn drained_lines_form_one_response_per_trigger() -> TestResult {
    init_tracing();
    let (task, _streams) = PersistentTask::spawn(
        "cat",
        opts("cat".to_string()),
        &InterpreterTable::default(),
    )?;

    let report = with_timeout(task.send("one\n\ntwo\n")).await?;
    assert_eq!(report.stdout.as_deref(), Some("one\ntwo"));

    let report = with_timeout(task.send("three\n")).await?;
    assert_eq!(report.stdout.as_deref(), Some("three"));
    Ok(())
}

#[tokio::test]
async fn silent_process_times_out_without_being_killed() -> TestResult {
    init_tracing();
    let task_opts = TaskOpts {
        timeout: Duration::from_millis(200),
        ..opts("sleep 30".to_string())
    };
    let (task, _streams) =
        PersistentTask::spawn("sleepy", task_opts, &InterpreterTable::default())?;

    let report = with_timeout(task.send("x\n")).await?;
    assert!(matches!(report.outcome, RunOutcome::TimedOut));

    // Still running, so there is something to kill.
    with_timeout(task.kill()).await?;
    Ok(())
}

#[tokio::test]
async fn late_reply_is_not_taken_as_the_next_response() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = script(
        &dir,
        "IFS= read -r line\n\
         sleep 0.6\n\
         printf 'resp %s<<END>>\\n' \"$line\"\n\
         while IFS= read -r line; do\n  printf 'resp %s<<END>>\\n' \"$line\"\ndone\n",
    )?;
    let task_opts = TaskOpts {
        timeout: Duration::from_millis(400),
        delimiter: Some("<<END>>".to_string()),
        ..opts(format!("sh {}", path.display()))
    };
    let (task, mut streams) =
        PersistentTask::spawn("slow-start", task_opts, &InterpreterTable::default())?;

    let first = with_timeout(task.send("one\n")).await?;
    assert!(matches!(first.outcome, RunOutcome::TimedOut));

    let second = with_timeout(task.send("two\n")).await?;
    assert!(second.outcome.is_success());
    assert_eq!(second.stdout.as_deref(), Some("resp two"));

    // The late reply still reaches the output stream, in order.
    assert_eq!(with_timeout(streams.outputs.recv()).await.as_deref(), Some("resp one"));
    assert_eq!(with_timeout(streams.outputs.recv()).await.as_deref(), Some("resp two"));
    Ok(())
}

#[tokio::test]
async fn exited_process_fails_triggers() -> TestResult {
    init_tracing();
    let (task, _streams) =
        PersistentTask::spawn("quick", opts("true".to_string()), &InterpreterTable::default())?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let report = with_timeout(task.send("x\n")).await?;
    assert!(matches!(
        report.outcome,
        RunOutcome::Errored(TaskError::ProcessExited | TaskError::Stdin(_))
    ));
    Ok(())
}

#[tokio::test]
async fn spawn_failure_is_reported_at_construction() {
    let err = PersistentTask::spawn(
        "missing",
        opts("definitely-not-a-real-binary-3141".to_string()),
        &InterpreterTable::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, TaskError::Spawn { .. }));
}
