//! Runner configuration (defaults, YAML file, environment)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Wall-clock limit for a single command
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Output ceiling for a single command
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 50_000;

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "DROPPY_RUNNER_CONFIG";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    ReadFailed(PathBuf, String),

    #[error("Invalid config {0}: {1}")]
    InvalidFormat(PathBuf, String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Timeout applied to requests built from this config (seconds)
    pub timeout_secs: u64,

    /// Output ceiling applied to requests built from this config (bytes)
    pub max_output_bytes: usize,

    /// Shell override; the user's login shell when unset
    pub shell: Option<PathBuf>,

    /// Working directory override; the user's home when unset
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for every command
    pub env: HashMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            shell: None,
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Load a YAML config file; missing keys keep their defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e.to_string()))?;

        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| ConfigError::InvalidFormat(path.to_path_buf(), e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, else from `DROPPY_RUNNER_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_yaml_file(path),
            None => match std::env::var_os(CONFIG_ENV_VAR) {
                Some(path) => Self::from_yaml_file(Path::new(&path)),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
