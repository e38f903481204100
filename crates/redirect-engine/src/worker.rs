//! Redirect worker: follow -> filter -> sink for one container.
//!
//! # State machine
//!
//! ```text
//!             open ok               Broken
//! Starting ----------> Running ----------------> Degraded
//!    |                  ^   |   <-------------      |
//!    |                  |   |   backoff, reopen ok  |
//!    |   sink recovers  |   | sink error            |
//!    |                  |   v                       |
//!    |                 Degraded (sink)              |
//!    |                                              |
//!    +--- NotFound / attempts exhausted ------------+--> Failed
//!    +--- Ended / cancelled ------------------------+--> Stopped
//! ```
//!
//! Failed opens and streams that break before delivering a line share one
//! attempt counter. It is cleared by the next delivered line, or once a
//! reattached stream has stayed up longer than the longest backoff delay.
//!
//! Appends run on the blocking pool. A write in progress always finishes
//! before cancellation is observed, so a stopped worker never leaves a
//! write behind.
//!
//! Every transition is reported on the event channel. The worker never
//! touches supervisor state; it only sends [`WorkerEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use logredirect_core::config::EngineConfig;
use logredirect_core::error::{FollowError, SinkError};
use logredirect_core::metrics as m;
use logredirect_core::types::{SourceSpec, WorkerState};

use crate::alert::AlertMatcher;
use crate::backoff::Backoff;
use crate::filter::should_keep;
use crate::follower::{FollowerCursor, LineEvent, LogSource, LogStream};
use crate::sink::{AppendOutcome, Rotation, RotatingSink, backup_path};

/// Retry and failure thresholds for a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Failed attempts in a row before giving up; 0 retries forever
    pub max_reconnect_attempts: u32,
    /// Failed writes in a row before giving up
    pub sink_failure_threshold: u32,
    /// Bound on one `LogSource::open`
    pub open_timeout: Duration,
    pub alert_dedup_window: Duration,
    /// Seed the first cursor from the output file's modification time
    pub resume_from_output: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl WorkerSettings {
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            reconnect_base_delay: engine.reconnect_base_delay(),
            reconnect_max_delay: engine.reconnect_max_delay(),
            max_reconnect_attempts: engine.max_reconnect_attempts,
            sink_failure_threshold: engine.sink_failure_threshold.max(1),
            open_timeout: engine.open_timeout(),
            alert_dedup_window: engine.alert_dedup_window(),
            resume_from_output: engine.resume_from_output,
        }
    }
}

/// Report from a worker to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Transition {
        source_id: String,
        generation: u64,
        from: WorkerState,
        to: WorkerState,
        reason: Option<String>,
    },
    PatternMatched {
        source_id: String,
        generation: u64,
        keyword: String,
        line: String,
    },
}

impl WorkerEvent {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Transition { source_id, .. } | Self::PatternMatched { source_id, .. } => {
                source_id
            }
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            Self::Transition { generation, .. } | Self::PatternMatched { generation, .. } => {
                *generation
            }
        }
    }
}

/// One container's redirect task.
pub struct RedirectWorker<S: LogSource> {
    spec: Arc<SourceSpec>,
    source: Arc<S>,
    settings: WorkerSettings,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
    state: WorkerState,
    /// `None` while an append runs on the blocking pool
    sink: Option<RotatingSink>,
    alerts: AlertMatcher,
    cursor: FollowerCursor,
    backoff: Backoff,
    sink_failures: u32,
}

impl<S: LogSource> RedirectWorker<S> {
    pub fn new(
        spec: Arc<SourceSpec>,
        source: Arc<S>,
        settings: WorkerSettings,
        generation: u64,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let sink = RotatingSink::from_spec(&spec);
        let alerts = AlertMatcher::new(spec.alert_keywords.clone(), settings.alert_dedup_window);
        let backoff = Backoff::new(settings.reconnect_base_delay, settings.reconnect_max_delay);
        Self {
            spec,
            source,
            settings,
            generation,
            events,
            cancel,
            state: WorkerState::Starting,
            sink: Some(sink),
            alerts,
            cursor: FollowerCursor::default(),
            backoff,
            sink_failures: 0,
        }
    }

    /// Runs until the worker reaches a terminal state and returns it.
    pub async fn run(mut self) -> WorkerState {
        let span = tracing::info_span!(
            "worker",
            source_id = %self.spec.source_id,
            generation = self.generation,
            run_id = %uuid::Uuid::new_v4(),
        );
        async move {
            let state = self.drive().await;
            if let Some(mut sink) = self.sink.take() {
                sink.close();
            }
            state
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> WorkerState {
        if self.settings.resume_from_output {
            self.cursor = self.seed_cursor().await;
            if let Some(after) = self.cursor.last_seen() {
                tracing::debug!(%after, "resuming after existing output");
            }
        }

        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(terminal) => return terminal,
        };
        self.transition(WorkerState::Running, "attached to log stream");
        let mut attached_at = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                event = stream.next_event() => Some(event),
            };

            let Some(event) = next else {
                stream.close();
                self.transition(WorkerState::Stopped, "stop requested");
                return WorkerState::Stopped;
            };

            match event {
                LineEvent::Line(line) => {
                    self.backoff.reset();
                    if let Err(e) = self.handle_line(line).await {
                        stream.close();
                        self.transition(WorkerState::Failed, e.to_string());
                        return WorkerState::Failed;
                    }
                }
                LineEvent::Idle => self.settle(attached_at),
                LineEvent::Ended => {
                    stream.close();
                    self.transition(WorkerState::Stopped, "container stopped");
                    return WorkerState::Stopped;
                }
                LineEvent::Broken(reason) => {
                    self.settle(attached_at);
                    self.cursor = stream.cursor();
                    stream.close();
                    self.transition(WorkerState::Degraded, reason.clone());

                    let err = FollowError::Unavailable {
                        source_id: self.spec.source_id.clone(),
                        reason,
                    };
                    if let Err(terminal) = self.back_off(&err).await {
                        return terminal;
                    }
                    stream = match self.connect().await {
                        Ok(stream) => stream,
                        Err(terminal) => return terminal,
                    };
                    attached_at = Instant::now();
                    self.transition(WorkerState::Running, "log stream reattached");
                }
            }
        }
    }

    /// Opens the stream, backing off between failures. On failure the
    /// terminal state has already been reported.
    async fn connect(&mut self) -> Result<S::Stream, WorkerState> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                res = tokio::time::timeout(
                    self.settings.open_timeout,
                    self.source.open(&self.spec.source_id, &self.cursor),
                ) => Some(res),
            };

            let err = match attempt {
                None => return Err(self.stop("stop requested while connecting")),
                Some(Ok(Ok(stream))) => return Ok(stream),
                Some(Ok(Err(e))) => e,
                Some(Err(_)) => FollowError::Unavailable {
                    source_id: self.spec.source_id.clone(),
                    reason: format!(
                        "open timed out after {}s",
                        self.settings.open_timeout.as_secs()
                    ),
                },
            };

            if !err.is_retryable() {
                self.transition(WorkerState::Failed, err.to_string());
                return Err(WorkerState::Failed);
            }
            self.back_off(&err).await?;
        }
    }

    /// Counts one failed attempt and sleeps for the backoff delay, or gives
    /// up once the attempt ceiling is reached.
    async fn back_off(&mut self, err: &FollowError) -> Result<(), WorkerState> {
        let attempts = self.backoff.attempts() + 1;
        let limit = self.settings.max_reconnect_attempts;
        if limit > 0 && attempts >= limit {
            self.transition(
                WorkerState::Failed,
                format!("giving up after {attempts} attempts: {err}"),
            );
            return Err(WorkerState::Failed);
        }

        let delay = self.backoff.next_delay();
        counter!(m::WORKER_RECONNECTS_TOTAL, m::LABEL_SOURCE => self.spec.source_id.clone())
            .increment(1);
        tracing::warn!(
            error = %err,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "log stream unavailable, retrying"
        );

        let slept = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };
        if !slept {
            return Err(self.stop("stop requested during backoff"));
        }
        Ok(())
    }

    /// Clears the attempt counter once a reattached stream has outlived the
    /// longest backoff delay, so quiet containers are not counted down.
    fn settle(&mut self, attached_at: Instant) {
        if self.backoff.attempts() > 0 && attached_at.elapsed() >= self.settings.reconnect_max_delay
        {
            self.backoff.reset();
        }
    }

    /// Newest modification time of the output file or its first backup.
    async fn seed_cursor(&self) -> FollowerCursor {
        let mut newest: Option<DateTime<Utc>> = None;
        for path in [
            self.spec.output_path.clone(),
            backup_path(&self.spec.output_path, 1),
        ] {
            if let Ok(meta) = tokio::fs::metadata(&path).await
                && let Ok(modified) = meta.modified()
            {
                newest = newest.max(Some(DateTime::<Utc>::from(modified)));
            }
        }
        newest.map(FollowerCursor::at).unwrap_or_default()
    }

    /// Filter, write, alert. Errors only once the sink has failed
    /// `sink_failure_threshold` times in a row.
    async fn handle_line(&mut self, line: String) -> Result<(), SinkError> {
        let source = self.spec.source_id.clone();
        counter!(m::WORKER_LINES_READ_TOTAL, m::LABEL_SOURCE => source.clone()).increment(1);

        if !should_keep(&line, &self.spec.exclude_keywords) {
            counter!(m::WORKER_LINES_EXCLUDED_TOTAL, m::LABEL_SOURCE => source).increment(1);
            return Ok(());
        }

        let (line, outcome) = match self.write(line).await {
            Ok(written) => written,
            Err(e) => return self.sink_failed(e, false),
        };
        counter!(m::SINK_BYTES_WRITTEN_TOTAL, m::LABEL_SOURCE => source.clone())
            .increment(outcome.bytes);
        self.raise_alert(&line);

        match outcome.rotation {
            Rotation::NotDue => self.sink_recovered(),
            Rotation::Rotated => {
                counter!(m::SINK_ROTATIONS_TOTAL, m::LABEL_SOURCE => source).increment(1);
                if let Some(sink) = &self.sink {
                    tracing::info!(
                        path = %sink.path().display(),
                        rotations = sink.rotations(),
                        "output file rotated"
                    );
                }
                self.sink_recovered();
            }
            Rotation::Failed(e) => return self.sink_failed(e, true),
        }
        Ok(())
    }

    /// Runs one append on the blocking pool and hands the line back.
    async fn write(&mut self, line: String) -> Result<(String, AppendOutcome), SinkError> {
        let mut sink = match self.sink.take() {
            Some(sink) => sink,
            None => RotatingSink::from_spec(&self.spec),
        };
        let joined = tokio::task::spawn_blocking(move || {
            let result = sink.append(&line);
            (sink, line, result)
        })
        .await;

        match joined {
            Ok((sink, line, result)) => {
                self.sink = Some(sink);
                result.map(|outcome| (line, outcome))
            }
            Err(e) => Err(SinkError::Io {
                path: self.spec.output_path.display().to_string(),
                reason: format!("write task failed: {e}"),
            }),
        }
    }

    fn raise_alert(&mut self, line: &str) {
        let Some(hit) = self.alerts.check(line) else {
            return;
        };
        counter!(m::WORKER_ALERTS_TOTAL, m::LABEL_SOURCE => self.spec.source_id.clone())
            .increment(1);
        tracing::info!(keyword = %hit.keyword, "alert keyword matched");
        let _ = self.events.send(WorkerEvent::PatternMatched {
            source_id: self.spec.source_id.clone(),
            generation: self.generation,
            keyword: hit.keyword,
            line: hit.line,
        });
    }

    fn sink_recovered(&mut self) {
        self.sink_failures = 0;
        if self.state == WorkerState::Degraded {
            self.transition(WorkerState::Running, "output file writable again");
        }
    }

    fn sink_failed(&mut self, err: SinkError, line_written: bool) -> Result<(), SinkError> {
        counter!(m::SINK_WRITE_ERRORS_TOTAL, m::LABEL_SOURCE => self.spec.source_id.clone())
            .increment(1);
        self.sink_failures += 1;
        if self.sink_failures >= self.settings.sink_failure_threshold {
            return Err(err);
        }

        if line_written {
            tracing::warn!(
                error = %err,
                consecutive_failures = self.sink_failures,
                "line written, rotation failed"
            );
        } else {
            tracing::warn!(
                error = %err,
                consecutive_failures = self.sink_failures,
                "write failed, line dropped"
            );
        }
        self.transition(WorkerState::Degraded, err.to_string());
        Ok(())
    }

    fn stop(&mut self, reason: &str) -> WorkerState {
        self.transition(WorkerState::Stopped, reason);
        WorkerState::Stopped
    }

    fn transition(&mut self, to: WorkerState, reason: impl Into<String>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        let reason = reason.into();

        counter!(
            m::WORKER_TRANSITIONS_TOTAL,
            m::LABEL_SOURCE => self.spec.source_id.clone(),
            m::LABEL_STATE => to.as_str()
        )
        .increment(1);

        match to {
            WorkerState::Failed => {
                tracing::error!(from = %from, to = %to, reason = %reason, "worker state changed")
            }
            WorkerState::Degraded => {
                tracing::warn!(from = %from, to = %to, reason = %reason, "worker state changed")
            }
            _ => tracing::info!(from = %from, to = %to, reason = %reason, "worker state changed"),
        }

        let _ = self.events.send(WorkerEvent::Transition {
            source_id: self.spec.source_id.clone(),
            generation: self.generation,
            from,
            to,
            reason: Some(reason),
        });
    }
}
