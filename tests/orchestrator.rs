// tests/orchestrator.rs

use std::error::Error;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use watchrun::engine::{DiscoveryRunner, Orchestrator, shutdown_channel};
use watchrun::exec::Task;
use watchrun::watch::{WatchConfig, Watcher};
use watchrun_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder, WatcherConfigBuilder};
use watchrun_test_utils::fake_task::{FakeOutcome, FakeTask};
use watchrun_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

async fn wait_for_payloads(task: &FakeTask, n: usize) {
    while task.payloads().len() < n {
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn events_reach_every_bound_task() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let watcher = Watcher::new(WatchConfig::new(dir.path()))?;
    let root = watcher.root().to_path_buf();

    let single = FakeTask::new("single");
    let persistent = FakeTask::new("persistent").line_based();
    let tasks: Vec<Arc<dyn Task>> = vec![Arc::new(single.clone()), Arc::new(persistent.clone())];

    let mut orchestrator = Orchestrator::new();
    orchestrator.bind("main", watcher.into_streams(), tasks);
    let (stop, shutdown) = shutdown_channel();
    let running = tokio::spawn(orchestrator.run(shutdown));

    fs::write(dir.path().join("a.txt"), "hello")?;

    with_timeout(wait_for_payloads(&single, 1)).await;
    with_timeout(wait_for_payloads(&persistent, 1)).await;

    let expected = root.join("a.txt").to_string_lossy().into_owned();
    assert_eq!(single.payloads()[0], expected);
    assert_eq!(persistent.payloads()[0], format!("{expected}\n"));

    stop.send(()).await?;
    with_timeout(running).await??;
    Ok(())
}

#[tokio::test]
async fn changes_made_during_a_run_are_ignored() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let watcher = Watcher::new(WatchConfig::new(dir.path()))?;

    let slow = FakeTask::new("slow").with_delay(Duration::from_millis(600));
    let mut orchestrator = Orchestrator::new();
    let tasks: Vec<Arc<dyn Task>> = vec![Arc::new(slow.clone())];
    orchestrator.bind("main", watcher.into_streams(), tasks);
    let (stop, shutdown) = shutdown_channel();
    let running = tokio::spawn(orchestrator.run(shutdown));

    fs::write(dir.path().join("first.txt"), "1")?;
    with_timeout(wait_for_payloads(&slow, 1)).await;

    // The task is still "running": this write is suppressed.
    sleep(Duration::from_millis(150)).await;
    fs::write(dir.path().join("during.txt"), "2")?;

    sleep(Duration::from_millis(900)).await;
    assert!(
        slow.payloads().iter().all(|p| p.ends_with("first.txt")),
        "unexpected payloads: {:?}",
        slow.payloads()
    );

    stop.send(()).await?;
    with_timeout(running).await??;
    Ok(())
}

#[tokio::test]
async fn discovery_runs_event_directory_first() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    for pkg in ["alpha", "beta", "gamma"] {
        fs::create_dir(dir.path().join(pkg))?;
        fs::write(dir.path().join(pkg).join("lib_test.go"), "package x")?;
    }
    fs::create_dir(dir.path().join("docs"))?;
    fs::write(dir.path().join("docs/readme.md"), "# docs")?;

    let config = WatchConfig {
        ext: Some("go".to_string()),
        ..WatchConfig::new(dir.path())
    };
    let watcher = Watcher::new(config.clone())?;
    let root = watcher.root().to_path_buf();

    let tests = FakeTask::new("go-test").with_outcome(FakeOutcome::TimeOut);
    let runner = DiscoveryRunner::new(Arc::new(tests.clone()), root.clone(), &config)?;
    assert_eq!(runner.eligible_dirs().len(), 3);

    let mut orchestrator = Orchestrator::new();
    orchestrator.bind_discovery("tests", watcher.into_streams(), runner);
    let (stop, shutdown) = shutdown_channel();
    let running = tokio::spawn(orchestrator.run(shutdown));

    fs::write(dir.path().join("beta/lib_test.go"), "package y")?;
    with_timeout(wait_for_payloads(&tests, 3)).await;

    let dirs: Vec<_> = tests.triggers().into_iter().filter_map(|t| t.dir).collect();
    assert_eq!(dirs[0], root.join("beta"));
    assert!(dirs[1..3].contains(&root.join("alpha")));
    assert!(dirs[1..3].contains(&root.join("gamma")));
    // Every timed-out run is killed explicitly.
    with_timeout(async {
        while tests.kills() < 3 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    stop.send(()).await?;
    with_timeout(running).await??;
    Ok(())
}

#[tokio::test]
async fn config_builds_one_binding_per_watcher() -> TestResult {
    init_tracing();
    let web = tempfile::tempdir()?;
    let api = tempfile::tempdir()?;

    let cfg = ConfigFileBuilder::new()
        .with_task("lint", TaskConfigBuilder::new("true").build())
        .with_task("unused", TaskConfigBuilder::new("true").build())
        .with_watcher(WatcherConfigBuilder::new(web.path()).ext("js").task("lint").build())
        .with_watcher(WatcherConfigBuilder::new(api.path()).task("lint").build())
        .build();

    let orchestrator = watchrun::build_orchestrator(&cfg)?;
    assert_eq!(orchestrator.len(), 2);
    Ok(())
}
