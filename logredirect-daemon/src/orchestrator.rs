//! Daemon assembly and lifecycle.
//!
//! The [`Orchestrator`] owns the startup configuration and wires the pieces
//! together:
//!
//! ```text
//! signals --Control--> Orchestrator --reload--> Supervisor --spawn--> workers
//!                                                   |
//!                      FileConfigProvider ----------+
//!                      DaemonNotifier <-- NotifierHandle
//!                      health reporter <-- SupervisorStatus (watch)
//! ```
//!
//! # Signals
//!
//! - `SIGHUP`: re-read the settings file now
//! - `SIGTERM` / `SIGINT`: stop all workers, remove the PID file, exit

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use logredirect_core::config::{EngineConfig, RedirectConfig};
use logredirect_core::metrics as m;
use logredirect_core::types::HealthStatus;
use logredirect_engine::{
    DockerLogSource, FollowSettings, LogSource, NotifierHandle, Supervisor, SupervisorSettings,
    SupervisorStatus,
};

use crate::health::{DaemonHealth, daemon_health, log_health};
use crate::metrics_server;
use crate::notify::DaemonNotifier;
use crate::provider::FileConfigProvider;

/// Upper bound on flushing queued notifications at shutdown.
const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const UPTIME_INTERVAL: Duration = Duration::from_secs(10);

/// Request delivered to a running daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Re-read the settings file immediately
    Reload,
    /// Stop; carries the name of the trigger for the log
    Shutdown(&'static str),
}

enum Wake {
    Control(Option<Control>),
    SupervisorExited(Result<(), JoinError>),
}

pub struct Orchestrator {
    config: RedirectConfig,
    config_path: PathBuf,
    start_time: Instant,
}

impl Orchestrator {
    /// Loads the settings file (with environment overrides) and builds.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = RedirectConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config, config_path)
    }

    /// Builds from an already-loaded configuration. `config_path` is the
    /// file re-read on every reload.
    ///
    /// Creates the central log directory and, when enabled, installs the
    /// metrics recorder.
    pub fn build_from_config(config: RedirectConfig, config_path: &Path) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        let central = Path::new(&config.general.central_log_path);
        std::fs::create_dir_all(central).map_err(|e| {
            anyhow::anyhow!(
                "failed to create central log directory {}: {}",
                central.display(),
                e
            )
        })?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        tracing::info!(
            config = %config_path.display(),
            central_log_path = %central.display(),
            email_alerts = config.general.email_alerts,
            "orchestrator initialized"
        );

        Ok(Self {
            config,
            config_path: config_path.to_path_buf(),
            start_time: Instant::now(),
        })
    }

    /// Connects to Docker and runs until SIGTERM or SIGINT.
    pub async fn run(&self) -> Result<()> {
        let source = connect_docker(&self.config.engine)?;
        match source.ping().await {
            Ok(()) => tracing::info!("docker daemon reachable"),
            Err(e) => tracing::warn!(
                error = %e,
                "docker daemon not reachable yet, workers will keep retrying"
            ),
        }

        let (control, listener) = spawn_signal_listener()?;
        let result = self.run_until(source, control).await;
        listener.abort();
        result
    }

    /// Runs the supervisor over `source` until a [`Control::Shutdown`]
    /// arrives or `control` closes.
    pub async fn run_until<S: LogSource>(
        &self,
        source: S,
        mut control: mpsc::Receiver<Control>,
    ) -> Result<()> {
        let pid_file = (!self.config.general.pid_file.is_empty())
            .then(|| PathBuf::from(&self.config.general.pid_file));
        if let Some(path) = &pid_file {
            write_pid_file(path)?;
        }

        let result = self.supervise(source, &mut control).await;

        if let Some(path) = &pid_file {
            remove_pid_file(path);
        }
        result
    }

    async fn supervise<S: LogSource>(
        &self,
        source: S,
        control: &mut mpsc::Receiver<Control>,
    ) -> Result<()> {
        let notifier = DaemonNotifier::from_config(&self.config)
            .map_err(|e| anyhow::anyhow!("failed to set up notifications: {}", e))?;
        let (handle, dispatcher) = NotifierHandle::spawn(
            notifier,
            self.config.engine.notify_queue_capacity,
            Duration::from_secs(self.config.email.timeout_secs),
        );

        let settings = SupervisorSettings::from_config(&self.config);
        let stop_budget = settings.stop_timeout + Duration::from_secs(1);
        let supervisor = Supervisor::new(Arc::new(source), settings, handle);
        let status_rx = supervisor.subscribe();
        let reload = supervisor.reload_trigger();
        let shutdown = CancellationToken::new();

        let provider = FileConfigProvider::new(&self.config_path);
        let mut supervisor_task = tokio::spawn(supervisor.run(provider, shutdown.clone()));
        let health_task = spawn_health_reporter(
            status_rx,
            self.start_time,
            shutdown.clone(),
            self.config.metrics.enabled,
        );

        tracing::info!("entering main loop");
        let outcome = loop {
            let wake = tokio::select! {
                res = &mut supervisor_task => Wake::SupervisorExited(res),
                msg = control.recv() => Wake::Control(msg),
            };

            match wake {
                Wake::Control(Some(Control::Reload)) => {
                    tracing::info!("reload requested");
                    reload.notify_one();
                }
                Wake::Control(Some(Control::Shutdown(signal))) => {
                    tracing::info!(signal, "shutdown signal received");
                    break None;
                }
                Wake::Control(None) => {
                    tracing::info!("control channel closed, shutting down");
                    break None;
                }
                Wake::SupervisorExited(res) => break Some(res),
            }
        };

        shutdown.cancel();

        let result = match outcome {
            Some(Ok(())) => Err(anyhow::anyhow!("supervisor exited unexpectedly")),
            Some(Err(e)) => Err(anyhow::anyhow!("supervisor task failed: {}", e)),
            None => match tokio::time::timeout(stop_budget, supervisor_task).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::anyhow!("supervisor task failed: {}", e)),
                Err(_) => {
                    tracing::warn!("supervisor did not stop in time");
                    Ok(())
                }
            },
        };

        let _ = health_task.await;

        // The supervisor owned the last handle; the dispatcher exits once
        // its queue is empty.
        if tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, dispatcher)
            .await
            .is_err()
        {
            tracing::warn!("pending notifications dropped at shutdown");
        }

        tracing::info!(
            uptime_secs = self.start_time.elapsed().as_secs(),
            "daemon stopped"
        );
        result
    }

    pub fn config(&self) -> &RedirectConfig {
        &self.config
    }
}

/// Builds the Docker source from `engine.docker_socket` (empty means the
/// platform default).
pub fn connect_docker(engine: &EngineConfig) -> Result<DockerLogSource> {
    let settings = FollowSettings::from_engine(engine);
    let source = if engine.docker_socket.is_empty() {
        DockerLogSource::connect_local(settings)
    } else {
        DockerLogSource::connect_with_socket(&engine.docker_socket, settings)
    };
    source.map_err(|e| anyhow::anyhow!("failed to create docker client: {}", e))
}

/// Translates SIGHUP, SIGTERM and SIGINT into [`Control`] messages.
fn spawn_signal_listener() -> Result<(mpsc::Receiver<Control>, JoinHandle<()>)> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow::anyhow!("failed to install SIGHUP handler: {}", e))?;

    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(async move {
        loop {
            let control = tokio::select! {
                _ = sigterm.recv() => Control::Shutdown("SIGTERM"),
                _ = sigint.recv() => Control::Shutdown("SIGINT"),
                _ = sighup.recv() => Control::Reload,
            };
            let last = matches!(control, Control::Shutdown(_));
            if tx.send(control).await.is_err() || last {
                break;
            }
        }
    });
    Ok((rx, task))
}

enum HealthWake {
    Stop,
    Status,
    Tick,
}

/// Logs the aggregated health whenever it changes and keeps the uptime
/// gauge fresh.
fn spawn_health_reporter(
    mut status_rx: watch::Receiver<SupervisorStatus>,
    start_time: Instant,
    shutdown: CancellationToken,
    record_uptime: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut uptime = tokio::time::interval(UPTIME_INTERVAL);
        uptime.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last: Option<HealthStatus> = None;

        loop {
            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled() => HealthWake::Stop,
                changed = status_rx.changed() => match changed {
                    Ok(()) => HealthWake::Status,
                    Err(_) => HealthWake::Stop,
                },
                _ = uptime.tick() => HealthWake::Tick,
            };

            match wake {
                HealthWake::Stop => break,
                HealthWake::Status => {
                    let status = status_rx.borrow_and_update().clone();
                    let health: DaemonHealth =
                        daemon_health(&status, start_time.elapsed().as_secs());
                    if last.as_ref() != Some(&health.status) {
                        log_health(&health);
                        last = Some(health.status);
                    } else {
                        tracing::debug!(sources = health.sources.len(), "status updated");
                    }
                }
                HealthWake::Tick => {
                    if record_uptime {
                        #[allow(clippy::cast_precision_loss)]
                        metrics::gauge!(m::DAEMON_UPTIME_SECONDS)
                            .set(start_time.elapsed().as_secs() as f64);
                    }
                }
            }
        }
        tracing::debug!("health reporter stopped");
    })
}

/// Writes the current PID to `path`, refusing to overwrite an existing
/// file.
///
/// The parent directory is created with mode 0o700 and the file with
/// 0o600. `create_new` makes the existence check and creation atomic.
pub fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::DirBuilder::new()
            .mode(0o700)
            .recursive(true)
            .create(parent)?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    if !file.metadata()?.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file",
            path.display()
        ));
    }
    file.set_permissions(fs::Permissions::from_mode(0o600))?;

    let pid = std::process::id();
    writeln!(file, "{}", pid)?;
    tracing::info!(pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Removes the PID file, logging instead of failing.
pub fn remove_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "PID file removed"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file"),
    }
}
