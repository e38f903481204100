//! Aggregated health reporting.
//!
//! Each redirected container maps to a [`HealthStatus`] derived from its
//! worker state; the daemon status is the worst of them, further lowered
//! while the settings file is unreadable or has rejected entries.
//!
//! # Aggregation Rule
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reason)
//! - Any Unhealthy -> Unhealthy(reason)

use serde::Serialize;

use logredirect_core::types::{HealthStatus, WorkerState};
use logredirect_engine::SupervisorStatus;

/// Aggregated health report for the entire daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Worst of all sources and the configuration.
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub sources: Vec<SourceHealth>,
}

/// Health of one redirected container.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    /// Settings entry name.
    pub name: String,
    pub state: WorkerState,
    pub status: HealthStatus,
}

/// Health implied by a worker state.
pub fn state_health(state: WorkerState) -> HealthStatus {
    match state {
        WorkerState::Running => HealthStatus::Healthy,
        WorkerState::Starting => HealthStatus::Degraded("attaching".to_owned()),
        WorkerState::Degraded => HealthStatus::Degraded("reconnecting or write errors".to_owned()),
        WorkerState::Stopped => HealthStatus::Degraded("container stopped".to_owned()),
        WorkerState::Failed => HealthStatus::Unhealthy("redirect failed".to_owned()),
    }
}

/// Returns the worst status found: Unhealthy > Degraded > Healthy.
pub fn aggregate_status(sources: &[SourceHealth]) -> HealthStatus {
    let mut worst = HealthStatus::Healthy;
    let mut reasons = Vec::new();

    for source in sources {
        match &source.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                if !worst.is_unhealthy() {
                    reasons.push(format!("{}: {}", source.name, reason));
                    worst = HealthStatus::Degraded(String::new());
                }
            }
            HealthStatus::Unhealthy(reason) => {
                if !worst.is_unhealthy() {
                    reasons.clear();
                }
                reasons.push(format!("{}: {}", source.name, reason));
                worst = HealthStatus::Unhealthy(String::new());
            }
        }
    }

    match worst {
        HealthStatus::Healthy => HealthStatus::Healthy,
        HealthStatus::Degraded(_) => HealthStatus::Degraded(reasons.join("; ")),
        HealthStatus::Unhealthy(_) => HealthStatus::Unhealthy(reasons.join("; ")),
    }
}

/// Builds the daemon report from a supervisor snapshot.
pub fn daemon_health(status: &SupervisorStatus, uptime_secs: u64) -> DaemonHealth {
    let mut sources: Vec<SourceHealth> = status
        .workers
        .values()
        .map(|w| SourceHealth {
            name: w.display_name.clone(),
            state: w.state,
            status: state_health(w.state),
        })
        .collect();

    let mut checks = sources.clone();
    if let Some(reason) = &status.config_error {
        checks.push(SourceHealth {
            name: "settings".to_owned(),
            state: WorkerState::Degraded,
            status: HealthStatus::Degraded(reason.clone()),
        });
    } else if status.rejected_entries > 0 {
        checks.push(SourceHealth {
            name: "settings".to_owned(),
            state: WorkerState::Degraded,
            status: HealthStatus::Degraded(format!(
                "{} container entries rejected",
                status.rejected_entries
            )),
        });
    }

    sources.sort_by(|a, b| a.name.cmp(&b.name));
    DaemonHealth {
        status: aggregate_status(&checks),
        uptime_secs,
        sources,
    }
}

/// Emits `health` at a level matching its status.
pub fn log_health(health: &DaemonHealth) {
    let running = health
        .sources
        .iter()
        .filter(|s| s.state == WorkerState::Running)
        .count();
    match &health.status {
        HealthStatus::Healthy => tracing::info!(
            sources = health.sources.len(),
            running,
            uptime_secs = health.uptime_secs,
            "daemon healthy"
        ),
        HealthStatus::Degraded(reason) => tracing::warn!(
            sources = health.sources.len(),
            running,
            reason = %reason,
            "daemon degraded"
        ),
        HealthStatus::Unhealthy(reason) => tracing::error!(
            sources = health.sources.len(),
            running,
            reason = %reason,
            "daemon unhealthy"
        ),
    }
}
