//! Error types, one enum per domain.
//!
//! Library crates return these; the daemon wraps them in `anyhow` at the edge.

/// Top-level error for the workspace.
#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Stream attachment error
    #[error("follow error: {0}")]
    Follow(#[from] FollowError),

    /// Output file error
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Supervisor error
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Notification delivery error
    #[error("notify error: {0}")]
    Notify(#[from] NotifyError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
///
/// Whole-file failures (`FileNotFound`, `ParseFailed`) abort a load.
/// Entry-level failures are collected in `ConfigSnapshot::rejected` and the
/// remaining entries are still used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Settings file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// Settings file is not valid YAML or has the wrong shape
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds a value outside its allowed range
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Two entries name the same container
    #[error("entry '{entry}' duplicates container '{source_id}'")]
    DuplicateSource { entry: String, source_id: String },

    /// Two entries write to the same output file
    #[error("entry '{entry}' duplicates output path '{path}'")]
    DuplicateOutput { entry: String, path: String },
}

/// Errors opening a container log stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FollowError {
    /// The container does not exist. Not retried.
    #[error("container not found: {source_id}")]
    NotFound { source_id: String },

    /// The runtime refused access
    #[error("permission denied for container {source_id}: {reason}")]
    PermissionDenied { source_id: String, reason: String },

    /// Runtime unreachable, container not running, or open timed out
    #[error("container {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },
}

impl FollowError {
    /// Whether a worker may retry the open after backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }
}

/// Errors writing or rotating an output file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("permission denied writing {path}")]
    PermissionDenied { path: String },

    #[error("disk full writing {path}")]
    DiskFull { path: String },

    #[error("invalid output path {path}: {reason}")]
    PathInvalid { path: String, reason: String },

    #[error("io error on {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Supervisor errors. Logged and retried on the next cycle.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A worker task panicked or was aborted
    #[error("worker {source_id} join failed: {reason}")]
    WorkerJoin { source_id: String, reason: String },

    /// Reading the desired configuration failed
    #[error("config snapshot failed: {0}")]
    Snapshot(#[from] ConfigError),

    /// A command was sent to a supervisor that already exited
    #[error("supervisor is not running")]
    NotRunning,
}

/// Notification delivery errors. Never propagated past the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("delivery timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("notification queue is full")]
    QueueFull,

    #[error("notification dispatcher is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_to_top_level() {
        let err: RedirectError = ConfigError::ParseFailed {
            reason: "bad indent".to_owned(),
        }
        .into();
        assert!(matches!(err, RedirectError::Config(_)));
        assert!(err.to_string().contains("bad indent"));
    }

    #[test]
    fn not_found_is_not_retryable() {
        let not_found = FollowError::NotFound {
            source_id: "web".to_owned(),
        };
        let unavailable = FollowError::Unavailable {
            source_id: "web".to_owned(),
            reason: "daemon down".to_owned(),
        };
        assert!(!not_found.is_retryable());
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn sink_error_display_names_path() {
        let err = SinkError::DiskFull {
            path: "/var/log/web.log".to_owned(),
        };
        assert_eq!(err.to_string(), "disk full writing /var/log/web.log");
    }
}
