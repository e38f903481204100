//! Operator notifications and their fire-and-forget dispatcher.
//!
//! The supervisor never waits on delivery. [`NotifierHandle::send`] queues a
//! [`Notification`] on a bounded channel; a single dispatcher task hands each
//! one to the [`Notifier`] under a timeout. A full queue or a failed delivery
//! is logged and counted, never propagated.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use logredirect_core::error::NotifyError;
use logredirect_core::metrics as m;

/// Something an operator should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A worker attached to its container for the first time
    WorkerStarted {
        source_id: String,
        display_name: String,
    },
    /// A worker reached `Failed`
    WorkerFailed {
        source_id: String,
        display_name: String,
        reason: String,
    },
    /// A kept line matched an alert keyword
    PatternMatched {
        source_id: String,
        display_name: String,
        keyword: String,
        line: String,
    },
    /// The settings file or one of its entries was rejected
    ConfigRejected { reason: String },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerStarted { .. } => "worker_started",
            Self::WorkerFailed { .. } => "worker_failed",
            Self::PatternMatched { .. } => "pattern_matched",
            Self::ConfigRejected { .. } => "config_rejected",
        }
    }

    /// Failures of the redirector itself, as opposed to news about the
    /// containers it follows.
    pub fn is_program_error(&self) -> bool {
        matches!(self, Self::WorkerFailed { .. } | Self::ConfigRejected { .. })
    }

    /// One-line description, suitable for a subject line.
    pub fn summary(&self) -> String {
        match self {
            Self::WorkerStarted { display_name, .. } => {
                format!("redirect started for {display_name}")
            }
            Self::WorkerFailed { display_name, .. } => {
                format!("redirect failed for {display_name}")
            }
            Self::PatternMatched {
                display_name,
                keyword,
                ..
            } => format!("'{keyword}' seen in {display_name}"),
            Self::ConfigRejected { .. } => "configuration rejected".to_owned(),
        }
    }

    /// Multi-line description for message bodies.
    pub fn details(&self) -> String {
        match self {
            Self::WorkerStarted {
                source_id,
                display_name,
            } => format!("Entry '{display_name}' is now redirecting container '{source_id}'."),
            Self::WorkerFailed {
                source_id,
                display_name,
                reason,
            } => format!(
                "Entry '{display_name}' stopped redirecting container '{source_id}'.\nReason: {reason}"
            ),
            Self::PatternMatched {
                source_id,
                display_name,
                keyword,
                line,
            } => format!(
                "Entry '{display_name}' (container '{source_id}') logged a line matching '{keyword}':\n\n{line}"
            ),
            Self::ConfigRejected { reason } => format!("Configuration problem: {reason}"),
        }
    }
}

/// Delivers notifications somewhere an operator will see them.
pub trait Notifier: Send + Sync + 'static {
    fn notify(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Cloneable sender side of the dispatcher.
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<Notification>,
}

impl NotifierHandle {
    /// Starts the dispatcher task. It exits once every handle is dropped
    /// and the queue has drained.
    pub fn spawn<N: Notifier>(
        notifier: N,
        capacity: usize,
        delivery_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(dispatch(notifier, rx, delivery_timeout));
        (Self { tx }, task)
    }

    /// Queues `notification` without waiting.
    pub fn send(&self, notification: Notification) {
        if let Err(e) = self.try_send(notification) {
            counter!(m::NOTIFY_DROPPED_TOTAL).increment(1);
            tracing::warn!(error = %e, "notification dropped");
        }
    }

    fn try_send(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

async fn dispatch<N: Notifier>(
    notifier: N,
    mut rx: mpsc::Receiver<Notification>,
    delivery_timeout: Duration,
) {
    while let Some(notification) = rx.recv().await {
        let kind = notification.kind();
        let result = match tokio::time::timeout(delivery_timeout, notifier.notify(&notification))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout {
                secs: delivery_timeout.as_secs(),
            }),
        };

        match result {
            Ok(()) => {
                counter!(m::NOTIFY_SENT_TOTAL, m::LABEL_KIND => kind, m::LABEL_RESULT => "success")
                    .increment(1);
                tracing::debug!(kind, "notification delivered");
            }
            Err(e) => {
                counter!(m::NOTIFY_SENT_TOTAL, m::LABEL_KIND => kind, m::LABEL_RESULT => "failure")
                    .increment(1);
                tracing::warn!(kind, error = %e, "notification delivery failed");
            }
        }
    }
    tracing::debug!("notification dispatcher stopped");
}
