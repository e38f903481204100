//! Docker Engine API follower.
//!
//! Opens `GET /containers/{id}/logs?follow=1&timestamps=1` through `bollard`.
//! Every frame carries an RFC 3339 timestamp prefix, which drives the cursor:
//! a reopen asks for `since = cursor` (whole seconds) and drops the lines at
//! or before the cursor that the runtime sends again.
//!
//! stdout and stderr are reassembled separately so a partial line on one
//! never absorbs bytes from the other.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{InspectContainerOptions, LogOutput, LogsOptions};
use chrono::{DateTime, Utc};
use tokio_stream::{Stream, StreamExt};

use logredirect_core::config::{EngineConfig, StartPosition};
use logredirect_core::error::FollowError;

use super::{FollowerCursor, LineEvent, LineSplitter, LogSource, LogStream};

type LogFrames = Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>;

/// Timing and positioning knobs shared by every stream.
#[derive(Debug, Clone)]
pub struct FollowSettings {
    pub idle_interval: Duration,
    /// Bound on each inspect call
    pub inspect_timeout: Duration,
    pub start_from: StartPosition,
}

impl Default for FollowSettings {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl FollowSettings {
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            idle_interval: engine.idle_interval(),
            inspect_timeout: engine.open_timeout(),
            start_from: engine.start_from,
        }
    }
}

/// [`LogSource`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerLogSource {
    docker: Arc<Docker>,
    settings: FollowSettings,
}

impl DockerLogSource {
    pub fn new(docker: Docker, settings: FollowSettings) -> Self {
        Self {
            docker: Arc::new(docker),
            settings,
        }
    }

    /// Uses the platform default socket.
    pub fn connect_local(settings: FollowSettings) -> Result<Self, bollard::errors::Error> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, settings))
    }

    pub fn connect_with_socket(
        socket_path: &str,
        settings: FollowSettings,
    ) -> Result<Self, bollard::errors::Error> {
        let docker = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self::new(docker, settings))
    }

    /// Checks daemon connectivity.
    pub async fn ping(&self) -> Result<(), bollard::errors::Error> {
        self.docker.ping().await.map(|_| ())
    }
}

impl LogSource for DockerLogSource {
    type Stream = DockerLogStream;

    async fn open(
        &self,
        source_id: &str,
        cursor: &FollowerCursor,
    ) -> Result<DockerLogStream, FollowError> {
        if !inspect_running(&self.docker, source_id, self.settings.inspect_timeout).await? {
            return Err(FollowError::Unavailable {
                source_id: source_id.to_owned(),
                reason: "container is not running".to_owned(),
            });
        }

        let (since, cursor) = match cursor.last_seen() {
            Some(ts) => (ts.timestamp(), *cursor),
            None => match self.settings.start_from {
                StartPosition::Beginning => (0, *cursor),
                StartPosition::Now => {
                    let now = Utc::now();
                    (now.timestamp(), FollowerCursor::at(now))
                }
            },
        };

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            since,
            tail: "all".to_owned(),
            ..Default::default()
        };
        let frames: LogFrames = Box::pin(self.docker.logs(source_id, Some(options)));

        tracing::debug!(source_id, since, "attached to container log stream");

        Ok(DockerLogStream {
            source_id: source_id.to_owned(),
            docker: Arc::clone(&self.docker),
            settings: self.settings.clone(),
            frames: Some(frames),
            stdout: LineSplitter::new(),
            stderr: LineSplitter::new(),
            pending: VecDeque::new(),
            verdict: None,
            resume_floor: cursor.last_seen(),
            cursor,
        })
    }
}

/// A followed Docker log stream.
pub struct DockerLogStream {
    source_id: String,
    docker: Arc<Docker>,
    settings: FollowSettings,
    frames: Option<LogFrames>,
    stdout: LineSplitter,
    stderr: LineSplitter,
    /// Parsed lines not yet handed out
    pending: VecDeque<(Option<DateTime<Utc>>, String)>,
    /// Terminal event to report once `pending` drains
    verdict: Option<LineEvent>,
    /// Lines stamped at or before this were delivered by an earlier stream
    resume_floor: Option<DateTime<Utc>>,
    cursor: FollowerCursor,
}

impl DockerLogStream {
    fn ingest(&mut self, output: LogOutput) {
        let raw_lines = match output {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                self.stdout.push(&message)
            }
            LogOutput::StdErr { message } => self.stderr.push(&message),
            LogOutput::StdIn { .. } => return,
        };
        for raw in raw_lines {
            self.queue(&raw);
        }
    }

    fn queue(&mut self, raw: &str) {
        let (ts, message) = split_timestamp(raw);
        if let (Some(ts), Some(floor)) = (ts, self.resume_floor)
            && ts <= floor
        {
            return;
        }
        self.pending.push_back((ts, message.trim_end().to_owned()));
    }

    /// Flushes unterminated tails once the transport is done.
    fn drain_partials(&mut self) {
        let tails: Vec<String> = [self.stdout.finish(), self.stderr.finish()]
            .into_iter()
            .flatten()
            .collect();
        for tail in tails {
            self.queue(&tail);
        }
    }
}

/// Decides what a closed transport means.
async fn end_verdict(docker: &Docker, source_id: &str, timeout: Duration) -> LineEvent {
    match inspect_running(docker, source_id, timeout).await {
        Ok(true) => LineEvent::Broken("log stream closed while container is running".to_owned()),
        Ok(false) | Err(FollowError::NotFound { .. }) => LineEvent::Ended,
        Err(e) => LineEvent::Broken(format!("log stream closed: {e}")),
    }
}

impl LogStream for DockerLogStream {
    async fn next_event(&mut self) -> LineEvent {
        loop {
            if let Some((ts, line)) = self.pending.pop_front() {
                if let Some(ts) = ts {
                    self.cursor.advance(ts);
                }
                return LineEvent::Line(line);
            }
            if let Some(verdict) = self.verdict.take() {
                return verdict;
            }
            let Some(frames) = self.frames.as_mut() else {
                return LineEvent::Ended;
            };

            match tokio::time::timeout(self.settings.idle_interval, frames.next()).await {
                Err(_) => return LineEvent::Idle,
                Ok(Some(Ok(output))) => self.ingest(output),
                Ok(Some(Err(e))) => {
                    // Partial lines are dropped; the reopen fetches them again.
                    if self.stdout.has_partial() || self.stderr.has_partial() {
                        tracing::debug!(
                            source_id = %self.source_id,
                            "discarding partial line on stream error"
                        );
                    }
                    self.frames = None;
                    self.stdout = LineSplitter::new();
                    self.stderr = LineSplitter::new();
                    self.verdict = Some(LineEvent::Broken(format!("log stream error: {e}")));
                }
                Ok(None) => {
                    self.frames = None;
                    self.drain_partials();
                    let docker = Arc::clone(&self.docker);
                    let verdict =
                        end_verdict(&docker, &self.source_id, self.settings.inspect_timeout).await;
                    self.verdict = Some(verdict);
                }
            }
        }
    }

    fn close(&mut self) {
        self.frames = None;
        self.pending.clear();
        self.verdict = None;
    }

    fn cursor(&self) -> FollowerCursor {
        self.cursor
    }
}

/// Splits `"<rfc3339> message"` into its timestamp and message. Lines
/// without a parseable prefix are returned whole.
fn split_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
    if let Some((prefix, rest)) = raw.split_once(' ')
        && let Ok(ts) = DateTime::parse_from_rfc3339(prefix)
    {
        return (Some(ts.with_timezone(&Utc)), rest);
    }
    match DateTime::parse_from_rfc3339(raw.trim_end()) {
        Ok(ts) => (Some(ts.with_timezone(&Utc)), ""),
        Err(_) => (None, raw),
    }
}

async fn inspect_running(
    docker: &Docker,
    source_id: &str,
    timeout: Duration,
) -> Result<bool, FollowError> {
    let inspected = tokio::time::timeout(
        timeout,
        docker.inspect_container(source_id, None::<InspectContainerOptions>),
    )
    .await
    .map_err(|_| FollowError::Unavailable {
        source_id: source_id.to_owned(),
        reason: format!("inspect timed out after {}s", timeout.as_secs()),
    })?
    .map_err(|e| classify(source_id, e))?;

    Ok(inspected
        .state
        .and_then(|state| state.running)
        .unwrap_or(false))
}

fn classify(source_id: &str, err: bollard::errors::Error) -> FollowError {
    use bollard::errors::Error;

    let source_id = source_id.to_owned();
    match err {
        Error::DockerResponseServerError {
            status_code: 404, ..
        } => FollowError::NotFound { source_id },
        Error::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => FollowError::PermissionDenied {
            source_id,
            reason: message,
        },
        other if io_kind(&other) == Some(io::ErrorKind::PermissionDenied) => {
            FollowError::PermissionDenied {
                source_id,
                reason: other.to_string(),
            }
        }
        other => FollowError::Unavailable {
            source_id,
            reason: other.to_string(),
        },
    }
}

/// Kind of the first `io::Error` in the source chain.
fn io_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = e.source();
    }
    None
}
