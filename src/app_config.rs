//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. A missing
//! file is not an error: every setting has a default.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use containerfs::store::METADATA_KEY;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn default_containers() -> Vec<String> {
    vec!["_public".to_owned(), "_documents".to_owned()]
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// The backing store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Maximum bytes of stored content. Unlimited if not specified.
    #[serde(default)]
    pub quota_bytes: Option<u64>,

    /// Containers linked under the root before the script runs.
    #[serde(default = "default_containers")]
    pub default_containers: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            default_containers: default_containers(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    /// Level used when neither `CONTAINERFS_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` listing every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.store.quota_bytes == Some(0) {
            errors.push("store.quota-bytes must be greater than zero.".to_owned());
        }

        let mut seen = HashSet::new();
        for name in &self.store.default_containers {
            if name.is_empty() || name.contains('/') {
                errors.push(format!(
                    "Default container name '{name}' must be a single non-empty path segment."
                ));
            } else if name == METADATA_KEY {
                errors.push(format!("Default container name '{name}' is reserved."));
            } else if !seen.insert(name.as_str()) {
                errors.push(format!("Default container '{name}' is listed more than once."));
            }
        }

        if self.log.level.parse::<tracing::Level>().is_err() {
            errors.push(format!(
                "Log level '{}' is not one of trace, debug, info, warn, error.",
                self.log.level
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("containerfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("containerfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/containerfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, else the first
    /// config file found, else defaults. Errors if a file exists but is
    /// malformed or invalid.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let found = match external_config_path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_config_file(),
        };
        let config = match found {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}
