//! Settings file provider tests.

use std::path::Path;

use logredirect_core::error::ConfigError;
use logredirect_daemon::provider::FileConfigProvider;
use logredirect_engine::ConfigProvider;
use serial_test::serial;

fn settings(central: &Path, containers: &str) -> String {
    format!(
        "general:\n  central_log_path: {}\ndocker_container:\n{}",
        central.display(),
        containers
    )
}

const WEB: &str = "  web:\n    container_name: web\n    log_name: web.log\n    max_log_file_size: 1024\n";
const DB: &str = "  db:\n    container_name: db\n    log_name: db.log\n    max_log_file_size: 1024\n    exclude: [DEBUG, TRACE]\n";

#[tokio::test]
#[serial]
async fn every_snapshot_rereads_the_file() {
    // Given: a settings file with one container
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, settings(dir.path(), WEB)).unwrap();
    let provider = FileConfigProvider::new(&path);

    let first = provider.snapshot().await.unwrap();
    assert_eq!(first.specs.len(), 1);

    // When: a second container is added
    std::fs::write(&path, settings(dir.path(), &format!("{WEB}{DB}"))).unwrap();
    let second = provider.snapshot().await.unwrap();

    // Then: the next snapshot sees it
    assert_eq!(second.specs.len(), 2);
    let db = &second.specs["db"];
    assert_eq!(db.output_path, dir.path().join("db.log"));
    assert!(db.exclude_keywords.contains("TRACE"));
}

#[tokio::test]
#[serial]
async fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileConfigProvider::new(dir.path().join("absent.yaml"));

    let err = provider.snapshot().await.unwrap_err();
    assert!(matches!(err, ConfigError::FileNotFound { .. }));
}

#[tokio::test]
#[serial]
async fn invalid_global_section_is_an_error() {
    // Given: a file whose general section fails validation
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(
        &path,
        format!("general:\n  central_log_path: {}\n  reload_interval_secs: 0\n", dir.path().display()),
    )
    .unwrap();

    // When: reading it
    let err = FileConfigProvider::new(&path).snapshot().await.unwrap_err();

    // Then: the whole read fails, so current workers are kept
    assert!(matches!(err, ConfigError::InvalidValue { .. }));
}

#[tokio::test]
#[serial]
async fn bad_entry_is_rejected_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    let bad = "  broken:\n    container_name: api\n    log_name: ../escape.log\n    max_log_file_size: 1024\n";
    std::fs::write(&path, settings(dir.path(), &format!("{WEB}{bad}"))).unwrap();

    let snapshot = FileConfigProvider::new(&path).snapshot().await.unwrap();
    assert_eq!(snapshot.specs.len(), 1);
    assert_eq!(snapshot.rejected.len(), 1);
}

#[tokio::test]
#[serial]
async fn environment_overrides_apply_on_reload() {
    // Given: a settings file and a central path override in the environment
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, settings(dir.path(), WEB)).unwrap();
    let elsewhere = dir.path().join("elsewhere");

    // SAFETY: serialized with every other test touching the environment.
    unsafe { std::env::set_var("LOGREDIRECT_GENERAL_CENTRAL_LOG_PATH", &elsewhere) };

    // When: reading the file
    let result = FileConfigProvider::new(&path).snapshot().await;

    // SAFETY: as above.
    unsafe { std::env::remove_var("LOGREDIRECT_GENERAL_CENTRAL_LOG_PATH") };

    // Then: outputs resolve against the overridden directory
    let snapshot = result.unwrap();
    assert_eq!(snapshot.specs["web"].output_path, elsewhere.join("web.log"));
}
