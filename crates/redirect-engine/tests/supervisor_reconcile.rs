//! Supervisor reconciliation, notification and reload behaviour.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use logredirect_core::config::ConfigSnapshot;
use logredirect_core::error::ConfigError;
use logredirect_core::types::{SourceSpec, WorkerState};
use logredirect_engine::{NotifierHandle, Supervisor, SupervisorSettings};

use common::*;

fn settings(restart_terminated: bool) -> SupervisorSettings {
    SupervisorSettings {
        worker: fast_settings(),
        reload_interval: Duration::from_secs(3600),
        stop_timeout: Duration::from_secs(1),
        restart_terminated,
    }
}

fn supervisor(
    source: ScriptedSource,
    restart_terminated: bool,
) -> (Supervisor<ScriptedSource>, RecordingNotifier) {
    let recorder = RecordingNotifier::default();
    let (handle, _task) = NotifierHandle::spawn(recorder.clone(), 64, Duration::from_secs(1));
    let sup = Supervisor::new(Arc::new(source), settings(restart_terminated), handle);
    (sup, recorder)
}

fn state_of(sup: &mut Supervisor<ScriptedSource>, id: &str) -> Option<WorkerState> {
    sup.drain_events();
    sup.states().get(id).copied()
}

#[tokio::test]
async fn second_reconcile_with_same_config_is_noop() {
    // Given: two configured containers
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new()
        .with_log("web", &["w"])
        .with_log("db", &["d"]);
    let (mut sup, _recorder) = supervisor(source, true);
    let desired = desired(&[spec(dir.path(), "web"), spec(dir.path(), "db")]);

    // When: the same configuration is applied twice
    let first = sup.reconcile(&desired).await;
    let second = sup.reconcile(&desired).await;

    // Then: the first pass starts both, the second changes nothing
    assert_eq!(first.started, vec!["db".to_owned(), "web".to_owned()]);
    assert!(second.is_noop());
    assert_eq!(second.unchanged, 2);
    assert_eq!(sup.worker_count(), 2);

    sup.shutdown().await;
}

#[tokio::test]
async fn changed_entry_restarts_only_that_worker() {
    // Given: two running workers
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new()
        .with_log("web", &["w"])
        .with_log("db", &["d"]);
    let (mut sup, _recorder) = supervisor(source, true);
    let web = spec(dir.path(), "web");
    let db = spec(dir.path(), "db");
    sup.reconcile(&desired(&[web.clone(), db.clone()])).await;
    wait_until(
        || {
            state_of(&mut sup, "web") == Some(WorkerState::Running)
                && state_of(&mut sup, "db") == Some(WorkerState::Running)
        },
        "both workers running",
    )
    .await;
    let status = sup.subscribe();
    let db_generation = status.borrow().workers["db"].generation;
    let web_generation = status.borrow().workers["web"].generation;

    // When: only web gains an exclude keyword
    let web = web.with_excludes(["healthz"]);
    let summary = sup.reconcile(&desired(&[web, db])).await;

    // Then: web is replaced, db keeps its worker
    assert_eq!(summary.restarted, vec!["web".to_owned()]);
    assert!(summary.started.is_empty());
    assert_eq!(summary.unchanged, 1);
    let status = status.borrow().clone();
    assert_eq!(status.workers["db"].generation, db_generation);
    assert!(status.workers["web"].generation > web_generation);

    sup.shutdown().await;
}

#[tokio::test]
async fn removed_entry_stops_its_worker() {
    // Given: two workers
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new()
        .with_log("web", &["w"])
        .with_log("db", &["d"]);
    let (mut sup, _recorder) = supervisor(source, true);
    let web = spec(dir.path(), "web");
    sup.reconcile(&desired(&[web.clone(), spec(dir.path(), "db")]))
        .await;

    // When: db disappears from the configuration
    let summary = sup.reconcile(&desired(&[web])).await;

    // Then: its worker is gone
    assert_eq!(summary.stopped, vec!["db".to_owned()]);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(sup.worker_count(), 1);
    assert!(!sup.states().contains_key("db"));

    sup.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn replacement_waits_for_a_worker_stuck_in_a_write() {
    // Given: a worker whose output is a FIFO nobody reads, so its first
    // write blocks
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("web.fifo");
    let made = std::process::Command::new("mkfifo")
        .arg(&fifo)
        .status()
        .unwrap();
    assert!(made.success());
    let source = ScriptedSource::new().with_log("web", &["line"]);
    let recorder = RecordingNotifier::default();
    let (notifier, _task) = NotifierHandle::spawn(recorder, 64, Duration::from_secs(1));
    let mut sup = Supervisor::new(
        Arc::new(source),
        SupervisorSettings {
            stop_timeout: Duration::from_millis(100),
            ..settings(true)
        },
        notifier,
    );
    let stuck = SourceSpec::new("web", fifo.clone(), 1024 * 1024);
    sup.reconcile(&desired(&[stuck])).await;
    wait_until(
        || state_of(&mut sup, "web") == Some(WorkerState::Running),
        "web running",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // When: the entry moves to a regular file
    let replacement = spec(dir.path(), "web");
    let summary = sup.reconcile(&desired(&[replacement.clone()])).await;

    // Then: the old worker is left to finish and no second writer starts
    assert_eq!(summary.deferred, vec!["web".to_owned()]);
    assert!(summary.restarted.is_empty());
    assert_eq!(sup.retiring(), vec!["web".to_owned()]);
    assert_eq!(sup.worker_count(), 0);

    // When: the blocked write completes
    let drained = tokio::task::spawn_blocking(move || std::fs::read_to_string(fifo).unwrap());
    assert_eq!(drained.await.unwrap(), "line\n");

    // Then: a later reconcile starts the replacement
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let summary = sup.reconcile(&desired(&[replacement.clone()])).await;
        if summary.started == vec!["web".to_owned()] {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "replacement never started"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(sup.retiring().is_empty());
    let path = replacement.output_path.clone();
    wait_until(|| read(&path) == "line\n", "replacement wrote the line").await;

    sup.shutdown().await;
}

#[tokio::test]
async fn missing_container_reports_exactly_one_failure() {
    // Given: an entry for a container that does not exist
    let dir = tempfile::tempdir().unwrap();
    let (mut sup, recorder) = supervisor(ScriptedSource::new(), false);
    let desired = desired(&[spec(dir.path(), "ghost")]);

    // When: it is reconciled, then reconciled again
    sup.reconcile(&desired).await;
    wait_until(
        || state_of(&mut sup, "ghost") == Some(WorkerState::Failed),
        "ghost worker failed",
    )
    .await;
    let again = sup.reconcile(&desired).await;

    // Then: the failed worker is left alone and one failure is reported
    assert!(again.is_noop());
    wait_until(|| recorder.count("worker_failed") == 1, "failure notice").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count("worker_failed"), 1);
    assert_eq!(recorder.count("worker_started"), 0);

    sup.shutdown().await;
}

#[tokio::test]
async fn terminal_worker_is_restarted_when_enabled() {
    // Given: a container whose stream ends on the first attach
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new()
        .with_log("web", &["w"])
        .then_open("web", OpenPlan::all_then(Tail::Ended));
    let (mut sup, _recorder) = supervisor(source, true);
    let desired = desired(&[spec(dir.path(), "web")]);
    sup.reconcile(&desired).await;
    wait_until(
        || state_of(&mut sup, "web") == Some(WorkerState::Stopped),
        "web stopped",
    )
    .await;

    // When: the next reload runs
    let summary = sup.reconcile(&desired).await;

    // Then: a fresh worker takes over
    assert_eq!(summary.restarted, vec!["web".to_owned()]);
    wait_until(
        || state_of(&mut sup, "web") == Some(WorkerState::Running),
        "web running again",
    )
    .await;

    sup.shutdown().await;
}

#[tokio::test]
async fn reconnect_does_not_repeat_start_notice() {
    // Given: a stream that breaks once after the first line
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new()
        .with_log("web", &["a", "b", "c"])
        .then_open("web", OpenPlan::Deliver { upto: 1, then: Tail::Broken });
    let (mut sup, recorder) = supervisor(source, true);
    let web = spec(dir.path(), "web");
    let path = web.output_path.clone();

    // When: the worker runs through the break
    sup.reconcile(&desired(&[web])).await;
    wait_until(|| read(&path) == "a\nb\nc\n", "all lines written").await;
    wait_until(
        || state_of(&mut sup, "web") == Some(WorkerState::Running),
        "web running",
    )
    .await;

    // Then: one start notice, no failure, no duplicated lines
    wait_until(|| recorder.count("worker_started") == 1, "start notice").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count("worker_started"), 1);
    assert_eq!(recorder.count("worker_failed"), 0);
    assert_eq!(read(&path), "a\nb\nc\n");

    sup.shutdown().await;
}

#[tokio::test]
async fn unreadable_config_keeps_workers_and_reports_once() {
    // Given: one running worker
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new().with_log("web", &["w"]);
    let (mut sup, recorder) = supervisor(source, true);
    let snapshot = ConfigSnapshot {
        specs: desired(&[spec(dir.path(), "web")]),
        rejected: Vec::new(),
    };
    assert!(sup.apply_snapshot(Ok(snapshot)).await.is_some());

    // When: the file becomes unparseable on two reloads in a row
    let broken = || -> Result<ConfigSnapshot, ConfigError> {
        Err(ConfigError::ParseFailed {
            reason: "mapping values are not allowed here".to_owned(),
        })
    };
    assert!(sup.apply_snapshot(broken()).await.is_none());
    assert!(sup.apply_snapshot(broken()).await.is_none());

    // Then: the worker survives and the problem is reported once
    assert_eq!(sup.worker_count(), 1);
    assert!(sup.subscribe().borrow().config_error.is_some());
    wait_until(|| recorder.count("config_rejected") == 1, "rejection notice").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count("config_rejected"), 1);

    sup.shutdown().await;
}

#[tokio::test]
async fn rejected_entries_are_reported_once_per_change() {
    // Given: a configuration with one bad entry
    let (mut sup, recorder) = supervisor(ScriptedSource::new(), true);
    let duplicate = ConfigError::DuplicateSource {
        entry: "web2".to_owned(),
        source_id: "web".to_owned(),
    };
    let with = |rejected: Vec<ConfigError>| -> Result<ConfigSnapshot, ConfigError> {
        Ok(ConfigSnapshot {
            specs: Default::default(),
            rejected,
        })
    };

    // When: the same rejection is read twice, then a new one appears
    sup.apply_snapshot(with(vec![duplicate.clone()])).await;
    sup.apply_snapshot(with(vec![duplicate.clone()])).await;
    let invalid = ConfigError::InvalidValue {
        field: "docker_container.api.max_log_file_size".to_owned(),
        reason: "must be greater than 0".to_owned(),
    };
    sup.apply_snapshot(with(vec![duplicate, invalid])).await;

    // Then: one notice per distinct rejection
    wait_until(|| recorder.count("config_rejected") == 2, "two notices").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count("config_rejected"), 2);
    assert_eq!(sup.subscribe().borrow().rejected_entries, 2);
}

#[tokio::test]
async fn run_loop_reloads_on_trigger_and_stops_on_shutdown() {
    // Given: a supervisor running against a provider with one entry
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new()
        .with_log("web", &["w"])
        .with_log("db", &["d"]);
    let (sup, _recorder) = supervisor(source, true);
    let provider = SharedProvider::new(desired(&[spec(dir.path(), "web")]));
    let status = sup.subscribe();
    let trigger = sup.reload_trigger();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(sup.run(provider.clone(), shutdown.clone()));

    wait_until(
        || status.borrow().workers.get("web").map(|w| w.state) == Some(WorkerState::Running),
        "web running",
    )
    .await;

    // When: an entry is added and a reload is requested
    provider.set(Ok(ConfigSnapshot {
        specs: desired(&[spec(dir.path(), "web"), spec(dir.path(), "db")]),
        rejected: Vec::new(),
    }));
    trigger.notify_one();

    // Then: the new worker appears without waiting for the interval
    wait_until(
        || status.borrow().workers.contains_key("db"),
        "db worker started",
    )
    .await;
    assert!(provider.reads() >= 2);
    let db_log = dir.path().join("db.log");
    wait_until(|| read(&db_log) == "d\n", "db line written").await;

    // When: shutdown is requested
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("supervisor should stop")
        .unwrap();

    // Then: every worker has been stopped
    assert!(status.borrow().workers.is_empty());
}
