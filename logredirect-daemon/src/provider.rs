//! Settings file as the supervisor's configuration source.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use logredirect_core::config::{ConfigSnapshot, RedirectConfig};
use logredirect_core::error::ConfigError;
use logredirect_engine::ConfigProvider;

/// Re-reads the settings file on every reload.
///
/// Environment overrides are applied to each read. Only the container
/// entries (and the central log path they resolve against) take effect on
/// reload; the other sections are read once at startup.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfigProvider {
    async fn snapshot(&self) -> Result<ConfigSnapshot, ConfigError> {
        let config = RedirectConfig::load(&self.path).await?;
        let snapshot = config.snapshot();
        tracing::debug!(
            path = %self.path.display(),
            accepted = snapshot.specs.len(),
            rejected = snapshot.rejected.len(),
            "settings file read"
        );
        Ok(snapshot)
    }
}

/// Human-readable summary printed by `--validate`.
pub fn validation_report(path: &Path, snapshot: &ConfigSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "settings file {} is valid", path.display());
    let _ = writeln!(out, "accepted containers: {}", snapshot.specs.len());
    for spec in snapshot.specs.values() {
        let _ = writeln!(
            out,
            "  {} ({}) -> {} [max {} bytes, {} backups, {} exclude, {} alert]",
            spec.display_name,
            spec.source_id,
            spec.output_path.display(),
            spec.max_bytes,
            spec.backup_count,
            spec.exclude_keywords.len(),
            spec.alert_keywords.len(),
        );
    }
    if !snapshot.rejected.is_empty() {
        let _ = writeln!(out, "rejected entries: {}", snapshot.rejected.len());
        for err in &snapshot.rejected {
            let _ = writeln!(out, "  {err}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use logredirect_core::types::SourceSpec;

    #[test]
    fn report_lists_accepted_and_rejected() {
        let spec = SourceSpec::new("web-1", "/var/log/redirect/web.log", 1024)
            .with_display_name("web")
            .with_excludes(["healthz"]);
        let snapshot = ConfigSnapshot {
            specs: [("web-1".to_owned(), spec)].into_iter().collect(),
            rejected: vec![ConfigError::InvalidValue {
                field: "docker_container.db.log_name".to_owned(),
                reason: "must be a plain file name".to_owned(),
            }],
        };

        let report = validation_report(Path::new("/etc/logredirect/settings.yaml"), &snapshot);
        assert!(report.contains("accepted containers: 1"));
        assert!(report.contains("web (web-1) -> /var/log/redirect/web.log"));
        assert!(report.contains("1 exclude, 0 alert"));
        assert!(report.contains("rejected entries: 1"));
        assert!(report.contains("docker_container.db.log_name"));
    }

    #[test]
    fn clean_report_has_no_rejected_section() {
        let report = validation_report(Path::new("s.yaml"), &ConfigSnapshot::default());
        assert!(report.contains("accepted containers: 0"));
        assert!(!report.contains("rejected"));
    }
}
