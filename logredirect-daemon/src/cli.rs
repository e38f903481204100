//! CLI argument definitions for the logredirect daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use logredirect_core::config::{DEFAULT_CONFIG_PATH, RedirectConfig};

/// Redirects Docker container logs into size-rotated files.
///
/// Follows every container listed under `docker_container` in the settings
/// file, drops lines matching exclude keywords and appends the rest to
/// `<central_log_path>/<log_name>`.
#[derive(Parser, Debug)]
#[command(name = "logredirect")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to the YAML settings file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the settings file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the settings file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate the settings file, list accepted and rejected containers,
    /// and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over the settings file).
    #[arg(long)]
    pub pid_file: Option<String>,
}

impl DaemonCli {
    /// Copies the flags that were given over the loaded configuration.
    pub fn apply_overrides(&self, config: &mut RedirectConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.general.log_format = format.clone();
        }
        if let Some(pid_file) = &self.pid_file {
            config.general.pid_file = pid_file.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_system_settings_path() {
        let cli = DaemonCli::parse_from(["logredirect"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!cli.validate);
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let cli = DaemonCli::parse_from([
            "logredirect",
            "--config",
            "/tmp/settings.yaml",
            "--log-level",
            "debug",
            "--pid-file",
            "/run/logredirect.pid",
        ]);
        let mut config = RedirectConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.general.pid_file, "/run/logredirect.pid");
    }

    #[test]
    fn validate_flag_parses() {
        let cli = DaemonCli::parse_from(["logredirect", "--validate"]);
        assert!(cli.validate);
    }
}
