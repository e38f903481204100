//! Stream follower: attaches to one container's live log output.
//!
//! [`LogSource`] opens streams; [`LogStream`] yields [`LineEvent`]s until the
//! container stops or the transport breaks. The production implementation
//! talks to the Docker Engine API ([`docker::DockerLogSource`]); tests script
//! their own.
//!
//! # Resumption
//!
//! Every delivered line advances the stream's [`FollowerCursor`]. A worker
//! that loses its stream reopens with the last cursor, and the source skips
//! anything at or before it, so a reconnect neither repeats nor drops lines
//! the runtime still retains.

pub mod docker;

use std::future::Future;

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};

use logredirect_core::error::FollowError;

pub use docker::{DockerLogSource, DockerLogStream, FollowSettings};

/// One step of a followed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A complete line, trailing whitespace removed
    Line(String),
    /// Nothing arrived within the idle interval
    Idle,
    /// The container stopped; no more lines will come
    Ended,
    /// The transport failed while the container may still be running
    Broken(String),
}

/// Position of the last delivered line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowerCursor {
    last_seen: Option<DateTime<Utc>>,
}

impl FollowerCursor {
    /// A cursor positioned at `ts`.
    pub fn at(ts: DateTime<Utc>) -> Self {
        Self {
            last_seen: Some(ts),
        }
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Whether no line has been delivered yet.
    pub fn is_fresh(&self) -> bool {
        self.last_seen.is_none()
    }

    /// Moves forward to `ts`; never moves backwards.
    pub fn advance(&mut self, ts: DateTime<Utc>) {
        if self.last_seen.is_none_or(|last| ts > last) {
            self.last_seen = Some(ts);
        }
    }

    /// Whether a line stamped `ts` was already delivered.
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        self.last_seen.is_some_and(|last| ts <= last)
    }
}

/// Opens log streams for containers.
///
/// Implementations must be cheap to share: one source serves every worker.
pub trait LogSource: Send + Sync + 'static {
    type Stream: LogStream;

    /// Attaches to `source_id`, resuming after `cursor`.
    ///
    /// # Errors
    ///
    /// - `FollowError::NotFound`: the container does not exist
    /// - `FollowError::PermissionDenied`: the runtime refused access
    /// - `FollowError::Unavailable`: runtime unreachable or container not running
    fn open(
        &self,
        source_id: &str,
        cursor: &FollowerCursor,
    ) -> impl Future<Output = Result<Self::Stream, FollowError>> + Send;
}

/// An attached stream.
pub trait LogStream: Send + 'static {
    /// Waits for the next event. Returns `Idle` after the idle interval
    /// without data, so callers never spin.
    fn next_event(&mut self) -> impl Future<Output = LineEvent> + Send;

    /// Detaches. Idempotent; later `next_event` calls return `Ended`.
    fn close(&mut self);

    /// Position after the last line returned by `next_event`.
    fn cursor(&self) -> FollowerCursor;
}

/// Reassembles lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: BytesMut,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed, without the
    /// terminating newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(pos);
            self.buf.advance(1);
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        lines
    }

    /// Returns the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = self.buf.split();
        Some(String::from_utf8_lossy(&raw).into_owned())
    }

    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
