//! Settings file: `settings.yaml` parsing, environment overrides and
//! per-entry validation.
//!
//! [`RedirectConfig`] holds every section. Global sections are validated as a
//! whole by [`RedirectConfig::validate`]; `docker_container` entries are
//! validated one at a time by [`RedirectConfig::snapshot`] so that one bad
//! entry never takes the others down with it.
//!
//! # Precedence
//! 1. CLI flags (applied by the daemon)
//! 2. Environment variables (`LOGREDIRECT_GENERAL_LOG_LEVEL=debug`)
//! 3. Settings file
//! 4. `Default` implementations
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), logredirect_core::error::ConfigError> {
//! use logredirect_core::config::RedirectConfig;
//!
//! let config = RedirectConfig::load("/etc/logredirect/settings.yaml").await?;
//! let snapshot = config.snapshot();
//! println!("{} sources, {} rejected", snapshot.specs.len(), snapshot.rejected.len());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::types::{DEFAULT_BACKUP_COUNT, SourceSpec};

/// Default settings file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/logredirect/settings.yaml";

/// Whole settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedirectConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Raw container entries keyed by entry name. Kept untyped here so each
    /// entry can fail on its own; see [`RedirectConfig::snapshot`].
    #[serde(default, deserialize_with = "null_as_default")]
    pub docker_container: BTreeMap<String, serde_yaml::Value>,
}

impl RedirectConfig {
    /// Reads the file, applies environment overrides and validates the
    /// global sections.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the file without overrides or validation.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::ParseFailed {
                    reason: format!("failed to read {}: {e}", path.display()),
                }
            }
        })?;
        Self::parse(&content)
    }

    /// Parses YAML text. An empty document yields the defaults.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Environment variable naming: `LOGREDIRECT_{SECTION}_{FIELD}`.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(
            &mut self.general.central_log_path,
            "LOGREDIRECT_GENERAL_CENTRAL_LOG_PATH",
        );
        override_parsed(
            &mut self.general.email_alerts,
            "LOGREDIRECT_GENERAL_EMAIL_ALERTS",
        );
        override_parsed(
            &mut self.general.alert_program_errors,
            "LOGREDIRECT_GENERAL_ALERT_PROGRAM_ERRORS",
        );
        override_string(&mut self.general.log_level, "LOGREDIRECT_GENERAL_LOG_LEVEL");
        override_string(
            &mut self.general.log_format,
            "LOGREDIRECT_GENERAL_LOG_FORMAT",
        );
        override_string(&mut self.general.pid_file, "LOGREDIRECT_GENERAL_PID_FILE");
        override_parsed(
            &mut self.general.reload_interval_secs,
            "LOGREDIRECT_GENERAL_RELOAD_INTERVAL_SECS",
        );

        // Engine
        override_parsed(
            &mut self.engine.backup_count,
            "LOGREDIRECT_ENGINE_BACKUP_COUNT",
        );
        override_parsed(
            &mut self.engine.max_reconnect_attempts,
            "LOGREDIRECT_ENGINE_MAX_RECONNECT_ATTEMPTS",
        );
        override_parsed(
            &mut self.engine.restart_terminated,
            "LOGREDIRECT_ENGINE_RESTART_TERMINATED",
        );
        override_parsed(&mut self.engine.start_from, "LOGREDIRECT_ENGINE_START_FROM");
        override_parsed(
            &mut self.engine.resume_from_output,
            "LOGREDIRECT_ENGINE_RESUME_FROM_OUTPUT",
        );
        override_string(
            &mut self.engine.docker_socket,
            "LOGREDIRECT_ENGINE_DOCKER_SOCKET",
        );

        // Email
        override_string(&mut self.email.smtp, "LOGREDIRECT_EMAIL_SMTP");
        override_parsed(
            &mut self.email.authentication_required,
            "LOGREDIRECT_EMAIL_AUTHENTICATION_REQUIRED",
        );
        override_parsed(&mut self.email.use_tls, "LOGREDIRECT_EMAIL_USE_TLS");
        override_string(&mut self.email.username, "LOGREDIRECT_EMAIL_USERNAME");
        override_string(&mut self.email.password, "LOGREDIRECT_EMAIL_PASSWORD");
        override_string(&mut self.email.from_email, "LOGREDIRECT_EMAIL_FROM_EMAIL");
        override_string(&mut self.email.to_email, "LOGREDIRECT_EMAIL_TO_EMAIL");

        // Metrics
        override_parsed(&mut self.metrics.enabled, "LOGREDIRECT_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "LOGREDIRECT_METRICS_LISTEN_ADDR",
        );
        override_parsed(&mut self.metrics.port, "LOGREDIRECT_METRICS_PORT");
    }

    /// Validates the global sections. Container entries are checked by
    /// [`snapshot`](Self::snapshot).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.general.central_log_path.trim().is_empty() {
            return Err(invalid("general.central_log_path", "must not be empty"));
        }
        if self.general.reload_interval_secs == 0 {
            return Err(invalid("general.reload_interval_secs", "must be > 0"));
        }

        self.engine.validate()?;

        if self.general.email_alerts {
            if self.email.smtp.trim().is_empty() {
                return Err(invalid(
                    "email.smtp",
                    "must not be empty when general.email_alerts is enabled",
                ));
            }
            self.email.relay()?;
            if self.email.recipients().is_empty() {
                return Err(invalid(
                    "email.to_email",
                    "must not be empty when general.email_alerts is enabled",
                ));
            }
            if self.email.from_email.trim().is_empty() {
                return Err(invalid(
                    "email.from_email",
                    "must not be empty when general.email_alerts is enabled",
                ));
            }
            if self.email.authentication_required
                && (self.email.username.is_empty() || self.email.password.is_empty())
            {
                return Err(invalid(
                    "email.username",
                    "username and password are required when email.authentication_required is set",
                ));
            }
        }
        if self.email.timeout_secs == 0 {
            return Err(invalid("email.timeout_secs", "must be > 0"));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid("metrics.port", "must be > 0 when metrics are enabled"));
        }

        Ok(())
    }

    /// Validates every `docker_container` entry and returns the accepted
    /// specs keyed by container name plus one error per rejected entry.
    ///
    /// Entries are visited in key order; when two entries collide on
    /// container name or output file, the later one is rejected.
    pub fn snapshot(&self) -> ConfigSnapshot {
        let central = Path::new(&self.general.central_log_path);
        let mut snapshot = ConfigSnapshot::default();
        let mut outputs: HashSet<PathBuf> = HashSet::new();

        for (key, raw) in &self.docker_container {
            let entry: ContainerEntry = match serde_yaml::from_value(raw.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    snapshot
                        .rejected
                        .push(invalid(format!("docker_container.{key}"), e.to_string()));
                    continue;
                }
            };

            let spec = match entry.into_spec(key, central, self.engine.backup_count) {
                Ok(spec) => spec,
                Err(e) => {
                    snapshot.rejected.push(e);
                    continue;
                }
            };

            if snapshot.specs.contains_key(&spec.source_id) {
                snapshot.rejected.push(ConfigError::DuplicateSource {
                    entry: key.clone(),
                    source_id: spec.source_id,
                });
                continue;
            }
            if !outputs.insert(spec.output_path.clone()) {
                snapshot.rejected.push(ConfigError::DuplicateOutput {
                    entry: key.clone(),
                    path: spec.output_path.display().to_string(),
                });
                continue;
            }

            snapshot.specs.insert(spec.source_id.clone(), spec);
        }

        snapshot
    }
}

/// Result of validating the container entries of one settings revision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    /// Accepted specs keyed by `source_id`
    pub specs: BTreeMap<String, SourceSpec>,
    /// One error per skipped entry
    pub rejected: Vec<ConfigError>,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding every redirected log file
    pub central_log_path: String,
    /// Master switch for email delivery
    pub email_alerts: bool,
    /// Also email worker failures and rejected entries
    pub alert_program_errors: bool,
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
    /// PID file path; empty disables it
    pub pid_file: String,
    /// Seconds between configuration re-reads
    pub reload_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            central_log_path: "/var/log/logredirect".to_owned(),
            email_alerts: false,
            alert_program_errors: true,
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: String::new(),
            reload_interval_secs: 3600,
        }
    }
}

impl GeneralConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

/// Where a follower starts reading on its first attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Everything the runtime still retains for the container
    #[default]
    Beginning,
    /// Only lines produced after attaching
    Now,
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginning" => Ok(Self::Beginning),
            "now" => Ok(Self::Now),
            other => Err(format!("unknown start position '{other}'")),
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beginning => f.write_str("beginning"),
            Self::Now => f.write_str("now"),
        }
    }
}

/// Redirect engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rotated backups kept per output file
    pub backup_count: u32,
    /// How long a follower waits for data before reporting idle
    pub idle_interval_ms: u64,
    /// Bound on each stream open attempt
    pub open_timeout_secs: u64,
    /// First reconnect delay
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay cap
    pub reconnect_max_delay_secs: u64,
    /// Failed opens before a worker gives up; 0 retries forever
    pub max_reconnect_attempts: u32,
    /// Consecutive write failures before a worker gives up
    pub sink_failure_threshold: u32,
    /// How long shutdown waits for one worker
    pub stop_timeout_secs: u64,
    /// Restart failed or stopped workers whose entry is still configured
    pub restart_terminated: bool,
    pub start_from: StartPosition,
    /// Start a new worker after the newest line its output file already
    /// holds, judged by the file's modification time
    pub resume_from_output: bool,
    /// Docker socket path; empty uses the platform default
    pub docker_socket: String,
    /// Suppress repeat pattern alerts for the same keyword within this window
    pub alert_dedup_window_secs: u64,
    /// Pending notifications before new ones are dropped
    pub notify_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_count: DEFAULT_BACKUP_COUNT,
            idle_interval_ms: 1000,
            open_timeout_secs: 30,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_secs: 60,
            max_reconnect_attempts: 10,
            sink_failure_threshold: 5,
            stop_timeout_secs: 5,
            restart_terminated: true,
            start_from: StartPosition::Beginning,
            resume_from_output: true,
            docker_socket: String::new(),
            alert_dedup_window_secs: 300,
            notify_queue_capacity: 256,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("engine.idle_interval_ms", self.idle_interval_ms),
            ("engine.open_timeout_secs", self.open_timeout_secs),
            ("engine.reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("engine.reconnect_max_delay_secs", self.reconnect_max_delay_secs),
            ("engine.stop_timeout_secs", self.stop_timeout_secs),
            (
                "engine.sink_failure_threshold",
                u64::from(self.sink_failure_threshold),
            ),
            ("engine.notify_queue_capacity", self.notify_queue_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be > 0"));
            }
        }

        if self.reconnect_base_delay() > self.reconnect_max_delay() {
            return Err(invalid(
                "engine.reconnect_base_delay_ms",
                "must not exceed engine.reconnect_max_delay_secs",
            ));
        }
        Ok(())
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn alert_dedup_window(&self) -> Duration {
        Duration::from_secs(self.alert_dedup_window_secs)
    }
}

/// SMTP delivery settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// Relay as `host` or `host:port`
    pub smtp: String,
    pub authentication_required: bool,
    /// Upgrade the connection with STARTTLS
    pub use_tls: bool,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub from_email: String,
    /// Comma-separated recipients
    pub to_email: String,
    pub subject_prefix: String,
    /// Bound on one delivery
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp: String::new(),
            authentication_required: false,
            use_tls: true,
            username: String::new(),
            password: String::new(),
            from_email: String::new(),
            to_email: String::new(),
            subject_prefix: "Docker Log Redirect".to_owned(),
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.password.is_empty() { "" } else { "***" };
        f.debug_struct("EmailConfig")
            .field("smtp", &self.smtp)
            .field("authentication_required", &self.authentication_required)
            .field("use_tls", &self.use_tls)
            .field("username", &self.username)
            .field("password", &password)
            .field("from_email", &self.from_email)
            .field("to_email", &self.to_email)
            .field("subject_prefix", &self.subject_prefix)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl EmailConfig {
    /// Relay host and port. Without an explicit port, 587 is used with
    /// STARTTLS and 25 without.
    pub fn relay(&self) -> Result<(String, u16), ConfigError> {
        let smtp = self.smtp.trim();
        let default_port = if self.use_tls { 587 } else { 25 };
        let (host, port) = match smtp.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| invalid("email.smtp", format!("invalid port in '{smtp}'")))?;
                (host, port)
            }
            None => (smtp, default_port),
        };
        if host.is_empty() {
            return Err(invalid("email.smtp", "missing host"));
        }
        Ok((host.to_owned(), port))
    }

    /// Non-empty recipients from `to_email`.
    pub fn recipients(&self) -> Vec<String> {
        self.to_email
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub port: u16,
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9187,
            endpoint: "/metrics".to_owned(),
        }
    }
}

/// One `docker_container` entry as written in the file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerEntry {
    pub container_name: String,
    pub log_name: String,
    pub max_log_file_size: u64,
    #[serde(default)]
    pub exclude: Option<Keywords>,
    #[serde(default)]
    pub alert: Option<Keywords>,
}

/// A keyword field given either as a single string or as a list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Keywords {
    One(String),
    Many(Vec<String>),
}

impl Keywords {
    fn into_set(self, field: &str) -> Result<BTreeSet<String>, ConfigError> {
        let items = match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        };
        let mut set = BTreeSet::new();
        for item in items {
            if item.is_empty() {
                return Err(invalid(field, "keywords must not be empty strings"));
            }
            set.insert(item);
        }
        Ok(set)
    }
}

impl ContainerEntry {
    fn into_spec(
        self,
        key: &str,
        central_log_path: &Path,
        backup_count: u32,
    ) -> Result<SourceSpec, ConfigError> {
        let field = |name: &str| format!("docker_container.{key}.{name}");

        if !is_valid_container_name(&self.container_name) {
            return Err(invalid(
                field("container_name"),
                format!(
                    "'{}' is not a valid container name ([a-zA-Z0-9][a-zA-Z0-9_.-]*)",
                    self.container_name
                ),
            ));
        }
        if !is_plain_file_name(&self.log_name) {
            return Err(invalid(
                field("log_name"),
                format!("'{}' must be a plain file name", self.log_name),
            ));
        }
        if self.max_log_file_size == 0 {
            return Err(invalid(field("max_log_file_size"), "must be > 0"));
        }

        let exclude_keywords = match self.exclude {
            Some(k) => k.into_set(&field("exclude"))?,
            None => BTreeSet::new(),
        };
        let alert_keywords = match self.alert {
            Some(k) => k.into_set(&field("alert"))?,
            None => BTreeSet::new(),
        };

        Ok(SourceSpec {
            source_id: self.container_name,
            display_name: key.to_owned(),
            output_path: central_log_path.join(&self.log_name),
            max_bytes: self.max_log_file_size,
            backup_count,
            exclude_keywords,
            alert_keywords,
        })
    }
}

fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// --- environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = std::any::type_name::<T>(),
                "failed to parse env var, ignoring"
            ),
        }
    }
}
