//! Process-wide configuration.
//!
//! Loaded once at startup and handed to commands as a read-only snapshot.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TarboxError};

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "TARBOX_CONFIG";

/// Top-level configuration file (`~/.tarbox/config.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TarboxConfig {
    /// Export engine defaults
    pub engine: EngineConfig,

    /// Local image store settings
    pub storage: StorageConfig,
}

/// Engine defaults applied to commands that don't override them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Treat extra `save` arguments as images rather than tags
    pub multi_image_archive: bool,
}

/// Image store configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Image store directory (defaults to ~/.tarbox/images)
    pub image_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved image store directory.
    pub fn image_dir(&self) -> PathBuf {
        self.image_dir
            .clone()
            .unwrap_or_else(|| tarbox_home().join("images"))
    }
}

impl TarboxConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TarboxError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&data).map_err(|e| {
            TarboxError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Load from `$TARBOX_CONFIG` or `~/.tarbox/config.yaml`.
    ///
    /// A missing default file yields the built-in defaults; a missing file
    /// named explicitly through the environment is an error.
    pub fn load_default() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let path = tarbox_home().join("config.yaml");
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }
}

/// Return the tarbox home directory (~/.tarbox).
pub fn tarbox_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".tarbox"))
        .unwrap_or_else(|| PathBuf::from(".tarbox"))
}
