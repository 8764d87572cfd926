//! Tests for root folder resolution and TOML config loading
//!
//! Tests that touch TRAYVE_ROOT are marked #[serial] so they never race on
//! the process environment.

use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;
use trayve_common::config::{
    ensure_root_folder, load_toml_config, resolve_root_folder, TomlConfig, DATABASE_FILE_NAME,
    DEFAULT_BIND_ADDRESS, ROOT_FOLDER_ENV,
};

#[test]
#[serial]
fn test_cli_argument_has_highest_priority() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/from-env");
    let toml = TomlConfig {
        root_folder: Some("/tmp/from-toml".to_string()),
        ..Default::default()
    };

    let resolved = resolve_root_folder(Some("/tmp/from-cli"), ROOT_FOLDER_ENV, Some(&toml));
    assert_eq!(resolved, PathBuf::from("/tmp/from-cli"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_environment_beats_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/from-env");
    let toml = TomlConfig {
        root_folder: Some("/tmp/from-toml".to_string()),
        ..Default::default()
    };

    let resolved = resolve_root_folder(None, ROOT_FOLDER_ENV, Some(&toml));
    assert_eq!(resolved, PathBuf::from("/tmp/from-env"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_toml_used_when_no_cli_or_env() {
    env::remove_var(ROOT_FOLDER_ENV);
    let toml = TomlConfig {
        root_folder: Some("/tmp/from-toml".to_string()),
        ..Default::default()
    };

    let resolved = resolve_root_folder(None, ROOT_FOLDER_ENV, Some(&toml));
    assert_eq!(resolved, PathBuf::from("/tmp/from-toml"));
}

#[test]
#[serial]
fn test_default_root_folder_when_nothing_configured() {
    env::remove_var(ROOT_FOLDER_ENV);

    let resolved = resolve_root_folder(None, ROOT_FOLDER_ENV, None);
    assert!(!resolved.as_os_str().is_empty());
    assert!(resolved.to_string_lossy().contains("trayve"));
}

#[test]
fn test_load_explicit_toml_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
root_folder = "/srv/trayve"
bind_address = "0.0.0.0:8080"

[logging]
level = "debug"

[pricing]
credits_per_image = 500
"#,
    )
    .unwrap();

    let config = load_toml_config(Some(&path)).unwrap();
    assert_eq!(config.root_folder.as_deref(), Some("/srv/trayve"));
    assert_eq!(config.bind_address(), "0.0.0.0:8080");
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_missing_sections_use_defaults() {
    let config: TomlConfig = toml::from_str("").unwrap();
    assert!(config.root_folder.is_none());
    assert_eq!(config.bind_address(), DEFAULT_BIND_ADDRESS);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_malformed_toml_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "root_folder = [unterminated").unwrap();

    let err = load_toml_config(Some(&path)).unwrap_err();
    assert!(matches!(err, trayve_common::Error::Config(_)));
}

#[test]
fn test_ensure_root_folder_creates_directory() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("nested").join("root");

    let db_path = ensure_root_folder(&root).unwrap();
    assert!(root.is_dir());
    assert_eq!(db_path, root.join(DATABASE_FILE_NAME));
}
