//! Supervisor: keeps one worker per configured container.
//!
//! The supervisor task is the only owner of the worker table. Workers report
//! through an unbounded channel; configuration arrives as immutable
//! [`ConfigSnapshot`]s on every reload tick (or on demand). Each snapshot is
//! reconciled against the table:
//!
//! | table                         | desired               | action            |
//! |-------------------------------|-----------------------|-------------------|
//! | absent                        | present               | start             |
//! | present                       | absent                | stop              |
//! | present, different settings   | present               | stop, then start  |
//! | present, `Failed`/`Stopped`   | present               | restart if enabled|
//! | present, live, same settings  | present               | nothing           |
//!
//! A replacement starts only after the worker it replaces has exited. A
//! worker that misses `stop_timeout` (typically stuck in a blocking write)
//! is left to finish in the background; until it does, starts for its id or
//! its output file are deferred and retried once it exits. Two workers never
//! write the same file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use logredirect_core::config::{ConfigSnapshot, RedirectConfig};
use logredirect_core::error::{ConfigError, SupervisorError};
use logredirect_core::metrics as m;
use logredirect_core::types::{SourceSpec, WorkerState};

use crate::follower::LogSource;
use crate::notifier::{Notification, NotifierHandle};
use crate::worker::{RedirectWorker, WorkerEvent, WorkerSettings};

/// Supplies the desired set of sources.
pub trait ConfigProvider: Send + Sync {
    /// Reads the current configuration.
    ///
    /// A whole-file failure is an `Err`; the supervisor then keeps its
    /// current workers. Individual bad entries belong in
    /// `ConfigSnapshot::rejected`.
    fn snapshot(&self) -> impl Future<Output = Result<ConfigSnapshot, ConfigError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub worker: WorkerSettings,
    pub reload_interval: Duration,
    /// How long a stop waits for workers before leaving them to finish in
    /// the background
    pub stop_timeout: Duration,
    /// Restart `Failed`/`Stopped` workers whose entry is still configured
    pub restart_terminated: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&RedirectConfig::default())
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &RedirectConfig) -> Self {
        Self {
            worker: WorkerSettings::from_engine(&config.engine),
            reload_interval: config.general.reload_interval(),
            stop_timeout: config.engine.stop_timeout(),
            restart_terminated: config.engine.restart_terminated,
        }
    }
}

/// What one reconciliation pass did. Ids are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// Stopped and started again (changed settings or terminal worker)
    pub restarted: Vec<String>,
    /// Not started because a previous worker for the same id or output file
    /// is still exiting
    pub deferred: Vec<String>,
    pub unchanged: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.restarted.is_empty()
            && self.deferred.is_empty()
    }
}

/// Published view of the worker table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub workers: BTreeMap<String, WorkerStatus>,
    /// Entries skipped by the last successful configuration read
    pub rejected_entries: usize,
    /// Set while the configuration file cannot be read
    pub config_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub display_name: String,
    pub state: WorkerState,
    pub generation: u64,
}

struct WorkerHandle {
    spec: Arc<SourceSpec>,
    cancel: CancellationToken,
    join: JoinHandle<WorkerState>,
    state: WorkerState,
    generation: u64,
}

impl WorkerHandle {
    /// A worker whose task ended may not have reported it yet.
    fn is_terminal(&self) -> bool {
        self.state.is_terminal() || self.join.is_finished()
    }
}

/// A stopped worker that missed `stop_timeout` and has not exited yet.
struct Retiring {
    output_path: PathBuf,
    generation: u64,
}

enum Wake {
    Shutdown,
    Event(WorkerEvent),
    Retired(String, u64),
    Reload,
}

/// Owns every redirect worker.
pub struct Supervisor<S: LogSource> {
    source: Arc<S>,
    settings: SupervisorSettings,
    notifier: NotifierHandle,
    handles: HashMap<String, WorkerHandle>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    retiring: HashMap<String, Retiring>,
    retired_tx: mpsc::UnboundedSender<(String, u64)>,
    retired_rx: mpsc::UnboundedReceiver<(String, u64)>,
    /// Last reconciled configuration, replayed when a retiring worker exits
    desired: BTreeMap<String, SourceSpec>,
    status_tx: watch::Sender<SupervisorStatus>,
    reload: Arc<Notify>,
    last_rejected: Vec<ConfigError>,
    config_error: Option<String>,
}

impl<S: LogSource> Supervisor<S> {
    pub fn new(source: Arc<S>, settings: SupervisorSettings, notifier: NotifierHandle) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (retired_tx, retired_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SupervisorStatus::default());
        Self {
            source,
            settings,
            notifier,
            handles: HashMap::new(),
            next_generation: 0,
            events_tx,
            events_rx,
            retiring: HashMap::new(),
            retired_tx,
            retired_rx,
            desired: BTreeMap::new(),
            status_tx,
            reload: Arc::new(Notify::new()),
            last_rejected: Vec::new(),
            config_error: None,
        }
    }

    /// Receives a fresh [`SupervisorStatus`] after every change.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// `notify_one()` on the returned handle triggers an immediate reload.
    pub fn reload_trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.reload)
    }

    /// Reloads on every tick until `shutdown` fires, then stops all workers.
    pub async fn run<P: ConfigProvider>(mut self, provider: P, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.reload_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reload = Arc::clone(&self.reload);

        tracing::info!(
            reload_interval_secs = self.settings.reload_interval.as_secs(),
            "supervisor started"
        );

        loop {
            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Wake::Shutdown,
                Some(event) = self.events_rx.recv() => Wake::Event(event),
                Some((id, generation)) = self.retired_rx.recv() => Wake::Retired(id, generation),
                _ = ticker.tick() => Wake::Reload,
                _ = reload.notified() => Wake::Reload,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Event(event) => self.handle_event(event),
                Wake::Retired(id, generation) => {
                    if self.retire(&id, generation) {
                        let desired = self.desired.clone();
                        self.reconcile(&desired).await;
                    }
                }
                Wake::Reload => {
                    let snapshot = provider.snapshot().await;
                    self.apply_snapshot(snapshot).await;
                }
            }
        }

        self.shutdown().await;
        tracing::info!("supervisor stopped");
    }

    /// Applies one configuration read. Returns the reconcile summary, or
    /// `None` when the read failed and nothing changed.
    pub async fn apply_snapshot(
        &mut self,
        snapshot: Result<ConfigSnapshot, ConfigError>,
    ) -> Option<ReconcileSummary> {
        match snapshot {
            Err(e) => {
                let err = SupervisorError::from(e);
                tracing::error!(
                    error = %err,
                    workers = self.handles.len(),
                    "configuration unreadable, keeping current workers"
                );
                let reason = err.to_string();
                if self.config_error.as_deref() != Some(reason.as_str()) {
                    self.notifier.send(Notification::ConfigRejected {
                        reason: reason.clone(),
                    });
                }
                self.config_error = Some(reason);
                self.publish_status();
                None
            }
            Ok(snapshot) => {
                self.config_error = None;
                for rejected in &snapshot.rejected {
                    tracing::warn!(error = %rejected, "container entry rejected");
                    if !self.last_rejected.contains(rejected) {
                        self.notifier.send(Notification::ConfigRejected {
                            reason: rejected.to_string(),
                        });
                    }
                }
                gauge!(m::SUPERVISOR_REJECTED_ENTRIES).set(snapshot.rejected.len() as f64);
                self.last_rejected = snapshot.rejected;
                Some(self.reconcile(&snapshot.specs).await)
            }
        }
    }

    /// Matches the worker table to `desired` (keyed by `source_id`).
    pub async fn reconcile(&mut self, desired: &BTreeMap<String, SourceSpec>) -> ReconcileSummary {
        self.drain_events();
        self.drain_retired();
        self.desired.clone_from(desired);

        let mut summary = ReconcileSummary::default();
        let mut to_stop = Vec::new();
        let mut restart = HashSet::new();

        for (id, handle) in &self.handles {
            match desired.get(id) {
                None => {
                    to_stop.push(id.clone());
                    summary.stopped.push(id.clone());
                }
                Some(spec) if *handle.spec != *spec => {
                    to_stop.push(id.clone());
                    restart.insert(id.clone());
                }
                Some(_) if handle.is_terminal() && self.settings.restart_terminated => {
                    to_stop.push(id.clone());
                    restart.insert(id.clone());
                }
                Some(_) => summary.unchanged += 1,
            }
        }

        self.stop_workers(&to_stop).await;

        for (id, spec) in desired {
            if self.handles.contains_key(id) {
                continue;
            }
            if let Some(blocker) = self.blocked_by_retiring(id, spec) {
                tracing::warn!(
                    source_id = %id,
                    retiring = %blocker,
                    "previous worker still exiting, start deferred"
                );
                summary.deferred.push(id.clone());
                continue;
            }
            self.start_worker(id, spec.clone());
            if restart.contains(id) {
                summary.restarted.push(id.clone());
            } else {
                summary.started.push(id.clone());
            }
        }

        summary.started.sort();
        summary.stopped.sort();
        summary.restarted.sort();
        summary.deferred.sort();

        counter!(m::SUPERVISOR_RECONCILES_TOTAL).increment(1);
        gauge!(m::SUPERVISOR_WORKERS).set(self.handles.len() as f64);
        self.publish_status();

        if summary.is_noop() {
            tracing::debug!(unchanged = summary.unchanged, "reconcile: no changes");
        } else {
            tracing::info!(
                started = ?summary.started,
                stopped = ?summary.stopped,
                restarted = ?summary.restarted,
                deferred = ?summary.deferred,
                unchanged = summary.unchanged,
                "reconcile applied"
            );
        }
        summary
    }

    /// Cancels every worker and waits for them, bounded by `stop_timeout`.
    /// Workers still retiring from earlier stops get one more `stop_timeout`.
    pub async fn shutdown(&mut self) {
        self.drain_events();
        self.desired.clear();
        let ids: Vec<String> = self.handles.keys().cloned().collect();
        self.stop_workers(&ids).await;

        let deadline = Instant::now() + self.settings.stop_timeout;
        while !self.retiring.is_empty() {
            match tokio::time::timeout_at(deadline, self.retired_rx.recv()).await {
                Ok(Some((id, generation))) => {
                    self.retire(&id, generation);
                }
                Ok(None) | Err(_) => {
                    let mut left: Vec<&String> = self.retiring.keys().collect();
                    left.sort();
                    tracing::warn!(workers = ?left, "workers still exiting at shutdown");
                    break;
                }
            }
        }

        gauge!(m::SUPERVISOR_WORKERS).set(0.0);
        self.publish_status();
    }

    /// Applies every report already queued by workers.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    /// Last reported state per source.
    pub fn states(&self) -> BTreeMap<String, WorkerState> {
        self.handles
            .iter()
            .map(|(id, h)| (id.clone(), h.state))
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Ids of stopped workers that have not exited yet, sorted.
    pub fn retiring(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.retiring.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn drain_retired(&mut self) {
        while let Ok((id, generation)) = self.retired_rx.try_recv() {
            self.retire(&id, generation);
        }
    }

    /// Forgets a retiring worker that has exited. Returns whether it was
    /// still tracked.
    fn retire(&mut self, id: &str, generation: u64) -> bool {
        let tracked = self
            .retiring
            .get(id)
            .is_some_and(|r| r.generation == generation);
        if tracked {
            self.retiring.remove(id);
            tracing::info!(source_id = id, generation, "retired worker exited");
            gauge!(m::SUPERVISOR_STOPPING_WORKERS).set(self.retiring.len() as f64);
        }
        tracked
    }

    /// The retiring worker, if any, that shares `id` or its output file.
    fn blocked_by_retiring(&self, id: &str, spec: &SourceSpec) -> Option<String> {
        if self.retiring.contains_key(id) {
            return Some(id.to_owned());
        }
        self.retiring
            .iter()
            .find(|(_, r)| r.output_path == spec.output_path)
            .map(|(other, _)| other.clone())
    }

    fn start_worker(&mut self, id: &str, spec: SourceSpec) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let spec = Arc::new(spec);
        let cancel = CancellationToken::new();

        let worker = RedirectWorker::new(
            Arc::clone(&spec),
            Arc::clone(&self.source),
            self.settings.worker.clone(),
            generation,
            self.events_tx.clone(),
            cancel.clone(),
        );
        let join = tokio::spawn(worker.run());

        tracing::info!(
            source_id = id,
            generation,
            output = %spec.output_path.display(),
            "worker spawned"
        );

        self.handles.insert(
            id.to_owned(),
            WorkerHandle {
                spec,
                cancel,
                join,
                state: WorkerState::Starting,
                generation,
            },
        );
    }

    /// Removes the handles, cancels them together and waits against one
    /// shared deadline. Workers that miss it move to the retiring set.
    async fn stop_workers(&mut self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let stopping: Vec<(String, WorkerHandle)> = ids
            .iter()
            .filter_map(|id| self.handles.remove_entry(id))
            .collect();
        for (_, handle) in &stopping {
            handle.cancel.cancel();
        }

        let deadline = Instant::now() + self.settings.stop_timeout;
        for (id, mut handle) in stopping {
            match tokio::time::timeout_at(deadline, &mut handle.join).await {
                Ok(Ok(state)) => {
                    tracing::debug!(source_id = %id, final_state = %state, "worker stopped");
                }
                Ok(Err(e)) => {
                    let err = SupervisorError::WorkerJoin {
                        source_id: id.clone(),
                        reason: e.to_string(),
                    };
                    tracing::error!(error = %err, "worker ended abnormally");
                }
                Err(_) => {
                    tracing::warn!(
                        source_id = %id,
                        timeout_ms = self.settings.stop_timeout.as_millis() as u64,
                        "worker did not stop in time, waiting in background"
                    );
                    let WorkerHandle {
                        spec,
                        join,
                        generation,
                        ..
                    } = handle;
                    let retired = self.retired_tx.clone();
                    let watched = id.clone();
                    tokio::spawn(async move {
                        let _ = join.await;
                        let _ = retired.send((watched, generation));
                    });
                    self.retiring.insert(
                        id,
                        Retiring {
                            output_path: spec.output_path.clone(),
                            generation,
                        },
                    );
                    gauge!(m::SUPERVISOR_STOPPING_WORKERS).set(self.retiring.len() as f64);
                }
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        let Some(handle) = self.handles.get_mut(event.source_id()) else {
            tracing::debug!(source_id = event.source_id(), "event from removed worker ignored");
            return;
        };
        if handle.generation != event.generation() {
            tracing::debug!(
                source_id = event.source_id(),
                event_generation = event.generation(),
                current_generation = handle.generation,
                "event from previous worker ignored"
            );
            return;
        }
        let display_name = handle.spec.display_name.clone();

        match event {
            WorkerEvent::Transition {
                source_id,
                from,
                to,
                reason,
                ..
            } => {
                handle.state = to;
                if from == WorkerState::Starting && to == WorkerState::Running {
                    self.notifier.send(Notification::WorkerStarted {
                        source_id,
                        display_name,
                    });
                } else if to == WorkerState::Failed {
                    self.notifier.send(Notification::WorkerFailed {
                        source_id,
                        display_name,
                        reason: reason.unwrap_or_default(),
                    });
                }
            }
            WorkerEvent::PatternMatched {
                source_id,
                keyword,
                line,
                ..
            } => {
                self.notifier.send(Notification::PatternMatched {
                    source_id,
                    display_name,
                    keyword,
                    line,
                });
            }
        }

        self.publish_status();
    }

    fn publish_status(&self) {
        let workers = self
            .handles
            .iter()
            .map(|(id, h)| {
                (
                    id.clone(),
                    WorkerStatus {
                        display_name: h.spec.display_name.clone(),
                        state: h.state,
                        generation: h.generation,
                    },
                )
            })
            .collect();
        self.status_tx.send_replace(SupervisorStatus {
            workers,
            rejected_entries: self.last_rejected.len(),
            config_error: self.config_error.clone(),
        });
    }
}
