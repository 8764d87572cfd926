//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "TRAYVE_ROOT";

/// Name of the database file inside the root folder
pub const DATABASE_FILE_NAME: &str = "trayve.db";

/// Default HTTP bind address
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:5740";

/// Base configuration shared by every Trayve service
///
/// Service-specific sections (pricing, providers, ...) live in the same TOML
/// file and are parsed by the owning service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database and stored artifacts
    pub root_folder: Option<String>,

    /// Address the HTTP server binds to
    pub bind_address: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging section of the TOML config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset (e.g. "info", "trayve_pipeline=debug")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Bind address, falling back to the compiled default
    pub fn bind_address(&self) -> &str {
        self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS)
    }
}

/// Root folder resolution, in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    toml_config: Option<&TomlConfig>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(root) = toml_config.and_then(|c| c.root_folder.as_deref()) {
        return PathBuf::from(root);
    }

    default_root_folder()
}

/// Locate the config file for the platform
///
/// Linux checks `~/.config/trayve/config.toml` first, then `/etc/trayve/config.toml`.
pub fn find_config_file() -> Result<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("trayve").join("config.toml"));

    if let Some(path) = user_config {
        if path.exists() {
            return Ok(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/trayve/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config("No config file found".to_string()))
}

/// Read and parse a TOML file into any deserializable config section
pub fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load the base config from an explicit path, or the platform config file if present
///
/// A missing platform config file is not an error; defaults are used.
pub fn load_toml_config(explicit: Option<&Path>) -> Result<TomlConfig> {
    match explicit {
        Some(path) => load_toml(path),
        None => match find_config_file() {
            Ok(path) => load_toml(&path),
            Err(_) => Ok(TomlConfig::default()),
        },
    }
}

/// Create the root folder if missing and return the database path inside it
pub fn ensure_root_folder(root_folder: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root_folder)?;
    Ok(root_folder.join(DATABASE_FILE_NAME))
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("trayve"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/trayve"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("trayve"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/trayve"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("trayve"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\trayve"))
    } else {
        PathBuf::from("./trayve_data")
    }
}
