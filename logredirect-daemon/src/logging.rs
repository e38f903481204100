//! Tracing subscriber setup.
//!
//! `general.log_level` applies to the daemon's own crates only; everything
//! else (Docker client, HTTP stack, SMTP) stays at `warn` so a `debug` run
//! shows redirect activity rather than transport chatter. `RUST_LOG`
//! replaces the whole filter when set.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use logredirect_core::config::GeneralConfig;

/// Targets that follow `general.log_level`.
const OWN_TARGETS: &[&str] = &[
    "logredirect",
    "logredirect_daemon",
    "logredirect_engine",
    "logredirect_core",
];

/// Level for every other target.
const THIRD_PARTY_LEVEL: &str = "warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, span fields included
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(anyhow::anyhow!(
                "unknown log format '{}', expected 'json' or 'pretty'",
                other
            )),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Filter directives for `level`: third-party targets at `warn`, the
/// daemon's crates at `level`.
pub fn filter_directives(level: &str) -> String {
    std::iter::once(THIRD_PARTY_LEVEL.to_owned())
        .chain(OWN_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(filter_directives(level))
        .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", level, e))
}

/// Installs the global subscriber. Call once, before the first event.
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let format: LogFormat = config.log_format.parse()?;
    let registry = tracing_subscriber::registry().with(build_filter(&config.log_level)?);

    let installed = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to initialize {} tracing subscriber: {}", format, e))
}
