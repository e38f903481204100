//! logredirect daemon library.
//!
//! Exposes the daemon's building blocks for integration testing; the
//! `logredirect` binary (main.rs) wires them together.

pub mod cli;
pub mod health;
pub mod logging;
pub mod metrics_server;
pub mod notify;
pub mod orchestrator;
pub mod provider;
