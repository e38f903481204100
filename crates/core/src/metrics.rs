//! Metric names and descriptions.
//!
//! Every metric emitted by the workspace is named here. Call sites use the
//! constants with `metrics::counter!()` / `metrics::gauge!()`.
//!
//! # Naming
//!
//! - prefix `logredirect_`
//! - component: `worker_`, `sink_`, `supervisor_`, `notify_`
//! - suffix `_total` for counters, none for gauges

// --- label keys ---

/// Container name label
pub const LABEL_SOURCE: &str = "source";

/// Worker state label
pub const LABEL_STATE: &str = "state";

/// Notification kind label
pub const LABEL_KIND: &str = "kind";

/// Result label (success, failure)
pub const LABEL_RESULT: &str = "result";

// --- worker ---

/// Lines read from container streams (counter, label: source)
pub const WORKER_LINES_READ_TOTAL: &str = "logredirect_worker_lines_read_total";

/// Lines dropped by exclude keywords (counter, label: source)
pub const WORKER_LINES_EXCLUDED_TOTAL: &str = "logredirect_worker_lines_excluded_total";

/// Stream reconnect attempts (counter, label: source)
pub const WORKER_RECONNECTS_TOTAL: &str = "logredirect_worker_reconnects_total";

/// State transitions (counter, labels: source, state)
pub const WORKER_TRANSITIONS_TOTAL: &str = "logredirect_worker_transitions_total";

/// Alert keyword hits that passed deduplication (counter, label: source)
pub const WORKER_ALERTS_TOTAL: &str = "logredirect_worker_alerts_total";

// --- sink ---

/// Bytes appended to output files (counter, label: source)
pub const SINK_BYTES_WRITTEN_TOTAL: &str = "logredirect_sink_bytes_written_total";

/// File rotations (counter, label: source)
pub const SINK_ROTATIONS_TOTAL: &str = "logredirect_sink_rotations_total";

/// Failed appends (counter, label: source)
pub const SINK_WRITE_ERRORS_TOTAL: &str = "logredirect_sink_write_errors_total";

// --- supervisor ---

/// Workers currently tracked (gauge)
pub const SUPERVISOR_WORKERS: &str = "logredirect_supervisor_workers";

/// Reconciliation passes (counter)
pub const SUPERVISOR_RECONCILES_TOTAL: &str = "logredirect_supervisor_reconciles_total";

/// Rejected container entries in the last snapshot (gauge)
pub const SUPERVISOR_REJECTED_ENTRIES: &str = "logredirect_supervisor_rejected_entries";

/// Workers cancelled but still running past the stop timeout (gauge)
pub const SUPERVISOR_STOPPING_WORKERS: &str = "logredirect_supervisor_stopping_workers";

// --- notifications ---

/// Notifications handed to the notifier (counter, labels: kind, result)
pub const NOTIFY_SENT_TOTAL: &str = "logredirect_notify_sent_total";

/// Notifications dropped because the queue was full (counter)
pub const NOTIFY_DROPPED_TOTAL: &str = "logredirect_notify_dropped_total";

// --- daemon ---

/// Build information (gauge, always 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "logredirect_daemon_build_info";

/// Seconds since the daemon started (gauge)
pub const DAEMON_UPTIME_SECONDS: &str = "logredirect_daemon_uptime_seconds";

/// Registers HELP text for every metric.
///
/// Call once after the global recorder is installed.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(
        WORKER_LINES_READ_TOTAL,
        "Lines read from container log streams"
    );
    describe_counter!(
        WORKER_LINES_EXCLUDED_TOTAL,
        "Lines dropped by exclude keywords"
    );
    describe_counter!(
        WORKER_RECONNECTS_TOTAL,
        "Attempts to reopen a container log stream"
    );
    describe_counter!(WORKER_TRANSITIONS_TOTAL, "Worker state transitions");
    describe_counter!(WORKER_ALERTS_TOTAL, "Alert keyword matches reported");

    describe_counter!(
        SINK_BYTES_WRITTEN_TOTAL,
        "Bytes appended to redirected log files"
    );
    describe_counter!(SINK_ROTATIONS_TOTAL, "Log file rotations");
    describe_counter!(SINK_WRITE_ERRORS_TOTAL, "Failed log file appends");

    describe_gauge!(SUPERVISOR_WORKERS, "Workers tracked by the supervisor");
    describe_counter!(SUPERVISOR_RECONCILES_TOTAL, "Reconciliation passes");
    describe_gauge!(
        SUPERVISOR_REJECTED_ENTRIES,
        "Container entries rejected by the last configuration read"
    );
    describe_gauge!(
        SUPERVISOR_STOPPING_WORKERS,
        "Workers still finishing after their stop timeout"
    );

    describe_counter!(NOTIFY_SENT_TOTAL, "Notifications delivered or failed");
    describe_counter!(
        NOTIFY_DROPPED_TOTAL,
        "Notifications dropped because the queue was full"
    );

    describe_gauge!(DAEMON_BUILD_INFO, "Build information (always 1)");
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Seconds since the daemon started");
}
