//! Notification delivery for the daemon.
//!
//! Every notification is logged. When `general.email_alerts` is on it is
//! also mailed through the configured SMTP relay, except program errors
//! (`WorkerFailed`, `ConfigRejected`) while `general.alert_program_errors`
//! is off.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use logredirect_core::config::{EmailConfig, RedirectConfig};
use logredirect_core::error::NotifyError;
use logredirect_engine::{Notification, Notifier};

/// Writes notifications to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let kind = notification.kind();
        let summary = notification.summary();
        if notification.is_program_error() {
            tracing::error!(kind, summary = %summary, details = %notification.details(), "notification");
        } else {
            tracing::info!(kind, summary = %summary, "notification");
        }
        Ok(())
    }
}

/// Sends plain-text mail over SMTP, upgrading with STARTTLS when
/// `email.use_tls` is set.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    relay: String,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject_prefix: String,
}

impl fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailNotifier")
            .field("relay", &self.relay)
            .field("from", &self.from.to_string())
            .field("recipients", &self.to.len())
            .finish_non_exhaustive()
    }
}

impl EmailNotifier {
    pub fn from_config(email: &EmailConfig) -> Result<Self> {
        let (host, port) = email.relay()?;
        let builder = if email.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
                .map_err(|e| anyhow::anyhow!("failed to set up TLS for {}: {}", host, e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host)
        };
        let mut builder = builder
            .port(port)
            .timeout(Some(Duration::from_secs(email.timeout_secs)));
        if email.authentication_required {
            builder = builder.credentials(Credentials::new(
                email.username.clone(),
                email.password.clone(),
            ));
        }

        let from = email
            .from_email
            .parse::<Mailbox>()
            .map_err(|e| anyhow::anyhow!("invalid email.from_email '{}': {}", email.from_email, e))?;
        let to = email
            .recipients()
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| anyhow::anyhow!("invalid email.to_email '{}': {}", addr, e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            transport: builder.build(),
            relay: format!("{host}:{port}"),
            from,
            to,
            subject_prefix: email.subject_prefix.clone(),
        })
    }

    /// The message for `notification`, stamped `now`.
    pub fn message(
        &self,
        notification: &Notification,
        now: DateTime<Local>,
    ) -> Result<Message, NotifyError> {
        let subject = header_value(&format!(
            "{} - {}",
            self.subject_prefix,
            notification.summary()
        ));
        let hint = if notification.is_program_error() {
            "Check the settings file and the daemon log. Send SIGHUP or wait for the next reload once fixed."
        } else {
            "The line was also written to the redirected log file."
        };
        let body = format!(
            "{details}\n\nReported at {stamp}.\n{hint}\n",
            details = notification.details(),
            stamp = now.format("%Y-%m-%d %H:%M:%S %z"),
        );

        let builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .date(now.into())
            .message_id(Some(format!("<{}@logredirect>", uuid::Uuid::new_v4())))
            .header(ContentType::TEXT_PLAIN);
        self.to
            .iter()
            .cloned()
            .fold(builder, |builder, to| builder.to(to))
            .body(body)
            .map_err(|e| NotifyError::Delivery(format!("failed to build message: {e}")))
    }
}

impl Notifier for EmailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.to.is_empty() {
            return Err(NotifyError::Delivery("no recipients configured".to_owned()));
        }
        let message = self.message(notification, Local::now())?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Delivery(format!("smtp relay {}: {e}", self.relay)))?;
        tracing::debug!(
            kind = notification.kind(),
            recipients = self.to.len(),
            code = %response.code(),
            "email sent"
        );
        Ok(())
    }
}

/// The daemon's notifier: always logs, mails when enabled.
#[derive(Debug)]
pub struct DaemonNotifier {
    log: LogNotifier,
    email: Option<EmailNotifier>,
    program_errors: bool,
}

impl DaemonNotifier {
    pub fn new(email: Option<EmailNotifier>, program_errors: bool) -> Self {
        Self {
            log: LogNotifier,
            email,
            program_errors,
        }
    }

    pub fn from_config(config: &RedirectConfig) -> Result<Self> {
        let email = if config.general.email_alerts {
            Some(EmailNotifier::from_config(&config.email)?)
        } else {
            None
        };
        Ok(Self::new(email, config.general.alert_program_errors))
    }

    /// Whether `notification` would be mailed.
    pub fn emails(&self, notification: &Notification) -> bool {
        self.email.is_some() && (self.program_errors || !notification.is_program_error())
    }
}

impl Notifier for DaemonNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.log.notify(notification).await?;
        match &self.email {
            Some(email) if self.emails(notification) => email.notify(notification).await,
            _ => Ok(()),
        }
    }
}

/// Folds a value onto one header line.
fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}
