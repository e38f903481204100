#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use error::{
    ConfigError, FollowError, NotifyError, RedirectError, SinkError, SupervisorError,
};

pub use config::{ConfigSnapshot, RedirectConfig};

pub use types::{HealthStatus, SourceSpec, WorkerState};
