//! Updater configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "DROPPY_UPDATER_CONFIG";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    ReadFailed(PathBuf, String),

    #[error("Invalid config {0}: {1}")]
    InvalidFormat(PathBuf, String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Where the update image is attached
    pub mount_point: PathBuf,

    /// Bundle expected at the root of the mounted image
    pub bundle_name: String,

    /// Folder revealed when manual removal is needed
    pub applications_dir: PathBuf,

    /// How many times to check that the old instance is gone
    pub termination_poll_attempts: u32,

    /// Delay between those checks (milliseconds)
    pub termination_poll_interval_ms: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/Volumes/DroppyUpdate"),
            bundle_name: "Droppy.app".to_string(),
            applications_dir: PathBuf::from("/Applications"),
            termination_poll_attempts: 20,
            termination_poll_interval_ms: 500,
        }
    }
}

impl UpdaterConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e.to_string()))?;

        serde_yaml::from_str(&raw)
            .map_err(|e| ConfigError::InvalidFormat(path.to_path_buf(), e.to_string()))
    }

    /// Load from an explicit path, else from `DROPPY_UPDATER_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_yaml_file(path),
            None => match std::env::var_os(CONFIG_ENV_VAR) {
                Some(path) => Self::from_yaml_file(Path::new(&path)),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn termination_poll_interval(&self) -> Duration {
        Duration::from_millis(self.termination_poll_interval_ms)
    }

    /// Path of the bundle inside the mounted image
    pub fn mounted_bundle(&self) -> PathBuf {
        self.mount_point.join(&self.bundle_name)
    }
}
