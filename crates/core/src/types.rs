//! Domain types shared by the engine and the daemon.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default number of rotated backups kept next to each output file.
pub const DEFAULT_BACKUP_COUNT: u32 = 4;

/// Validated description of one redirected container.
///
/// Immutable once handed to a worker. A changed `SourceSpec` for the same
/// `source_id` is applied by stopping the old worker and starting a new one,
/// so every field that affects output participates in equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Container name passed to the runtime
    pub source_id: String,
    /// Settings entry key
    pub display_name: String,
    /// Live output file
    pub output_path: PathBuf,
    /// Rotation threshold in bytes, always > 0
    pub max_bytes: u64,
    /// Rotated backups to keep
    pub backup_count: u32,
    /// Lines containing any of these are dropped
    pub exclude_keywords: BTreeSet<String>,
    /// Kept lines containing any of these raise an alert
    pub alert_keywords: BTreeSet<String>,
}

impl SourceSpec {
    pub fn new(
        source_id: impl Into<String>,
        output_path: impl Into<PathBuf>,
        max_bytes: u64,
    ) -> Self {
        let source_id = source_id.into();
        Self {
            display_name: source_id.clone(),
            source_id,
            output_path: output_path.into(),
            max_bytes,
            backup_count: DEFAULT_BACKUP_COUNT,
            exclude_keywords: BTreeSet::new(),
            alert_keywords: BTreeSet::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_backup_count(mut self, count: u32) -> Self {
        self.backup_count = count;
        self
    }

    pub fn with_excludes<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_alerts<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alert_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }
}

/// Lifecycle state of a redirect worker.
///
/// ```text
/// Starting -> Running <-> Degraded
///    |           |            |
///    +-----------+------------+--> Stopped | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Degraded,
    Failed,
    Stopped,
}

impl WorkerState {
    /// `Failed` and `Stopped` end a worker instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Working with reduced capability
    Degraded(String),
    /// Not working
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkerState::Failed.is_terminal());
        assert!(WorkerState::Stopped.is_terminal());
        assert!(!WorkerState::Starting.is_terminal());
        assert!(!WorkerState::Running.is_terminal());
        assert!(!WorkerState::Degraded.is_terminal());
    }

    #[test]
    fn spec_equality_tracks_keywords() {
        let a = SourceSpec::new("web", "/tmp/web.log", 1024).with_excludes(["DEBUG"]);
        let b = SourceSpec::new("web", "/tmp/web.log", 1024).with_excludes(["DEBUG"]);
        let c = SourceSpec::new("web", "/tmp/web.log", 1024).with_excludes(["TRACE"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn new_spec_uses_default_backup_count() {
        let spec = SourceSpec::new("db", "/tmp/db.log", 10);
        assert_eq!(spec.backup_count, DEFAULT_BACKUP_COUNT);
        assert_eq!(spec.display_name, "db");
    }

    #[test]
    fn worker_state_serializes_lowercase() {
        let json = serde_json::to_string(&WorkerState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }

    #[test]
    fn health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(
            HealthStatus::Unhealthy("down".to_owned()).to_string(),
            "unhealthy: down"
        );
    }
}
