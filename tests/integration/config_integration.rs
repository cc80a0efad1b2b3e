//! Integration tests for Configuration System

use genforge::config::{ConfigLoader, GenforgeConfig, ValidationError};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use super::test_utils::with_env;

fn write_workspace_config(workspace: &TempDir, name: &str, body: &str) -> PathBuf {
    let dir = workspace.path().join("config");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_defaults_without_any_files() {
    let workspace = TempDir::new().unwrap();
    let config = with_env(&[], || ConfigLoader::load_layers(None, workspace.path())).unwrap();

    assert_eq!(config.queue.concurrency_limit, 3);
    assert_eq!(config.queue.max_rate_limit_retries, Some(8));
    assert_eq!(config.jobs.stale_after_secs, 600);
    assert_eq!(config.jobs.settled_retention_secs, 86_400);
    assert!(config.endpoints.base_url.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn test_workspace_file_overrides_global_file() {
    let global_dir = TempDir::new().unwrap();
    let global = global_dir.path().join("config.toml");
    fs::write(
        &global,
        r#"
[queue]
concurrency_limit = 5
retry_base_delay_ms = 250

[endpoints]
base_url = "https://global.example"
"#,
    )
    .unwrap();

    let workspace = TempDir::new().unwrap();
    write_workspace_config(
        &workspace,
        "config.toml",
        r#"
[queue]
concurrency_limit = 2

[jobs]
content_timeout_secs = 20
"#,
    );

    let config = with_env(&[], || {
        ConfigLoader::load_layers(Some(global.as_path()), workspace.path())
    })
    .unwrap();

    assert_eq!(config.queue.concurrency_limit, 2);
    assert_eq!(config.queue.retry_base_delay_ms, 250);
    assert_eq!(config.jobs.content_timeout_secs, 20);
    assert_eq!(
        config.endpoints.base_url.as_deref(),
        Some("https://global.example")
    );
}

#[test]
fn test_environment_file_and_variables_win() {
    let workspace = TempDir::new().unwrap();
    write_workspace_config(
        &workspace,
        "config.toml",
        "[queue]\nconcurrency_limit = 2\n",
    );
    write_workspace_config(
        &workspace,
        "staging.toml",
        "[queue]\nconcurrency_limit = 4\n\n[jobs]\nstale_after_secs = 900\n",
    );

    let config = with_env(
        &[
            ("GENFORGE_ENV", "staging"),
            ("GENFORGE__JOBS__STALE_AFTER_SECS", "1200"),
        ],
        || ConfigLoader::load_layers(None, workspace.path()),
    )
    .unwrap();

    assert_eq!(config.queue.concurrency_limit, 4);
    assert_eq!(config.jobs.stale_after_secs, 1200);
}

#[test]
fn test_invalid_values_are_reported_per_section() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(
        &path,
        r#"
[queue]
concurrency_limit = 0

[jobs]
stale_after_secs = 10
content_timeout_secs = 60

[logging]
level = "shouting"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&path).unwrap();
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| matches!(e, ValidationError::Queue(_))));
    assert!(errors.iter().any(|e| matches!(e, ValidationError::Jobs(_))));
    assert!(errors.iter().any(|e| matches!(e, ValidationError::Logging(_))));
}

#[test]
fn test_rendered_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let mut config = GenforgeConfig::default();
    config.queue.concurrency_limit = 7;
    config.endpoints.base_url = Some("http://localhost:8080".to_string());
    config.storage.data_dir = Some(dir.path().join("data"));

    let path = dir.path().join("rendered.toml");
    fs::write(&path, config.to_toml().unwrap()).unwrap();

    let loaded = ConfigLoader::load_from_file(&path).unwrap();
    assert_eq!(loaded.queue.concurrency_limit, 7);
    assert_eq!(
        loaded.endpoints.base_url.as_deref(),
        Some("http://localhost:8080")
    );
    assert_eq!(loaded.storage.jobs_path(), dir.path().join("data").join("jobs"));
}
