//! Shared fixtures: a scripted log source, a recording notifier and polling
//! helpers.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use logredirect_core::config::ConfigSnapshot;
use logredirect_core::error::{ConfigError, FollowError, NotifyError};
use logredirect_core::types::{SourceSpec, WorkerState};
use logredirect_engine::{
    ConfigProvider, FollowerCursor, LineEvent, LogSource, LogStream, Notification, Notifier,
    WorkerEvent, WorkerSettings,
};

/// How the stream behaves once its lines run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    Broken,
    Ended,
    /// Reports `Idle` forever
    Idle,
}

/// Outcome of one `open` call.
#[derive(Debug, Clone)]
pub enum OpenPlan {
    Fail(FollowError),
    /// Replays `log[..upto]` after the cursor, then `then`
    Deliver { upto: usize, then: Tail },
    /// Never completes
    Hang,
}

impl OpenPlan {
    pub fn all_then(then: Tail) -> Self {
        Self::Deliver {
            upto: usize::MAX,
            then,
        }
    }
}

struct Container {
    log: Vec<String>,
    plans: VecDeque<OpenPlan>,
    fallback: OpenPlan,
    cursors: Vec<FollowerCursor>,
}

/// Line `i` of every container log is stamped `i + 1` seconds after epoch.
pub fn stamp(index: usize) -> DateTime<Utc> {
    Utc.timestamp_opt(index as i64 + 1, 0).single().unwrap()
}

/// `LogSource` whose containers follow a script.
#[derive(Default)]
pub struct ScriptedSource {
    containers: Mutex<HashMap<String, Container>>,
    opens: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a container whose opens default to replaying `lines` and
    /// then idling.
    pub fn with_log(self, id: &str, lines: &[&str]) -> Self {
        self.containers.lock().unwrap().insert(
            id.to_owned(),
            Container {
                log: lines.iter().map(|l| (*l).to_owned()).collect(),
                plans: VecDeque::new(),
                fallback: OpenPlan::all_then(Tail::Idle),
                cursors: Vec::new(),
            },
        );
        self
    }

    /// Queues the outcome of the next unscripted open.
    pub fn then_open(self, id: &str, plan: OpenPlan) -> Self {
        self.containers
            .lock()
            .unwrap()
            .get_mut(id)
            .expect("register the container with with_log first")
            .plans
            .push_back(plan);
        self
    }

    /// Outcome once the queued plans run out.
    pub fn otherwise(self, id: &str, plan: OpenPlan) -> Self {
        self.containers
            .lock()
            .unwrap()
            .get_mut(id)
            .expect("register the container with with_log first")
            .fallback = plan;
        self
    }

    pub fn total_opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn opens(&self, id: &str) -> usize {
        self.cursors(id).len()
    }

    /// Cursor passed to every open of `id`, in order.
    pub fn cursors(&self, id: &str) -> Vec<FollowerCursor> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.cursors.clone())
            .unwrap_or_default()
    }
}

impl LogSource for ScriptedSource {
    type Stream = ScriptedStream;

    async fn open(
        &self,
        source_id: &str,
        cursor: &FollowerCursor,
    ) -> Result<ScriptedStream, FollowError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let planned = {
            let mut containers = self.containers.lock().unwrap();
            match containers.get_mut(source_id) {
                None => Err(FollowError::NotFound {
                    source_id: source_id.to_owned(),
                }),
                Some(container) => {
                    container.cursors.push(*cursor);
                    let plan = container
                        .plans
                        .pop_front()
                        .unwrap_or_else(|| container.fallback.clone());
                    Ok((plan, container.log.clone()))
                }
            }
        };
        let (plan, log) = planned?;

        match plan {
            OpenPlan::Fail(e) => Err(e),
            OpenPlan::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            OpenPlan::Deliver { upto, then } => {
                let items = log
                    .into_iter()
                    .enumerate()
                    .take(upto)
                    .map(|(i, line)| (stamp(i), line))
                    .filter(|(ts, _)| !cursor.covers(*ts))
                    .collect();
                Ok(ScriptedStream {
                    items,
                    tail: then,
                    cursor: *cursor,
                    closed: false,
                })
            }
        }
    }
}

pub struct ScriptedStream {
    items: VecDeque<(DateTime<Utc>, String)>,
    tail: Tail,
    cursor: FollowerCursor,
    closed: bool,
}

impl LogStream for ScriptedStream {
    async fn next_event(&mut self) -> LineEvent {
        if self.closed {
            return LineEvent::Ended;
        }
        if let Some((ts, line)) = self.items.pop_front() {
            self.cursor.advance(ts);
            return LineEvent::Line(line);
        }
        match self.tail {
            Tail::Broken => LineEvent::Broken("connection reset".to_owned()),
            Tail::Ended => LineEvent::Ended,
            Tail::Idle => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                LineEvent::Idle
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.items.clear();
    }

    fn cursor(&self) -> FollowerCursor {
        self.cursor
    }
}

/// `LogSource` with one stream that delivers whatever the test sends.
/// Closing the sender ends the stream.
pub struct FedSource {
    lines: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl FedSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            lines: Mutex::new(Some(rx)),
        };
        (source, tx)
    }
}

impl LogSource for FedSource {
    type Stream = FedStream;

    async fn open(&self, source_id: &str, cursor: &FollowerCursor) -> Result<FedStream, FollowError> {
        let lines = self.lines.lock().unwrap().take();
        match lines {
            Some(lines) => Ok(FedStream {
                lines,
                cursor: *cursor,
                sent: 0,
            }),
            None => Err(FollowError::Unavailable {
                source_id: source_id.to_owned(),
                reason: "stream already taken".to_owned(),
            }),
        }
    }
}

pub struct FedStream {
    lines: mpsc::UnboundedReceiver<String>,
    cursor: FollowerCursor,
    sent: usize,
}

impl LogStream for FedStream {
    async fn next_event(&mut self) -> LineEvent {
        match tokio::time::timeout(Duration::from_millis(20), self.lines.recv()).await {
            Err(_) => LineEvent::Idle,
            Ok(None) => LineEvent::Ended,
            Ok(Some(line)) => {
                self.cursor.advance(stamp(self.sent));
                self.sent += 1;
                LineEvent::Line(line)
            }
        }
    }

    fn close(&mut self) {
        self.lines.close();
    }

    fn cursor(&self) -> FollowerCursor {
        self.cursor
    }
}

/// Notifier that remembers everything it was asked to deliver.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind() == kind)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.seen.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Provider whose snapshot can be swapped between reloads.
#[derive(Clone)]
pub struct SharedProvider {
    current: Arc<Mutex<Result<ConfigSnapshot, ConfigError>>>,
    reads: Arc<AtomicUsize>,
}

impl SharedProvider {
    pub fn new(specs: BTreeMap<String, SourceSpec>) -> Self {
        Self {
            current: Arc::new(Mutex::new(Ok(ConfigSnapshot {
                specs,
                rejected: Vec::new(),
            }))),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set(&self, snapshot: Result<ConfigSnapshot, ConfigError>) {
        *self.current.lock().unwrap() = snapshot;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ConfigProvider for SharedProvider {
    async fn snapshot(&self) -> Result<ConfigSnapshot, ConfigError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.current.lock().unwrap().clone()
    }
}

/// Short delays so retry paths finish quickly.
pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        reconnect_base_delay: Duration::from_millis(5),
        reconnect_max_delay: Duration::from_millis(20),
        max_reconnect_attempts: 5,
        sink_failure_threshold: 3,
        open_timeout: Duration::from_millis(200),
        alert_dedup_window: Duration::from_secs(60),
        resume_from_output: false,
    }
}

pub fn spec(dir: &Path, id: &str) -> SourceSpec {
    SourceSpec::new(id, dir.join(format!("{id}.log")), 1024 * 1024)
}

pub fn desired(specs: &[SourceSpec]) -> BTreeMap<String, SourceSpec> {
    specs
        .iter()
        .map(|s| (s.source_id.clone(), s.clone()))
        .collect()
}

pub fn unavailable(id: &str) -> FollowError {
    FollowError::Unavailable {
        source_id: id.to_owned(),
        reason: "daemon restarting".to_owned(),
    }
}

pub fn not_found(id: &str) -> FollowError {
    FollowError::NotFound {
        source_id: id.to_owned(),
    }
}

/// Drains every queued worker event.
pub fn collect_events(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// `(from, to)` of every transition event.
pub fn transitions(events: &[WorkerEvent]) -> Vec<(WorkerState, WorkerState)> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Transition { from, to, .. } => Some((*from, *to)),
            WorkerEvent::PatternMatched { .. } => None,
        })
        .collect()
}

/// Polls `cond` every 10ms for up to 10s.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
