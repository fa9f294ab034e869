//! CLI configuration management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Output format for reports.
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Log line format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Default slot limit when neither the pipeline nor the command sets one.
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Upper bound on any single step.
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub skip_actions: bool,
}

fn default_step_timeout_seconds() -> Option<u64> {
    Some(3600)
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::default(),
            log_format: LogFormat::default(),
            max_parallel: None,
            step_timeout_seconds: default_step_timeout_seconds(),
            retry_count: 0,
            skip_actions: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Unknown config key: {0}")]
    UnknownKey(String),
    #[error("Invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl CliConfig {
    /// Load configuration from the user config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults. The load error is handed
    /// back so the caller can report it once logging is up.
    pub fn load_or_default(path: &Path) -> (Self, Option<ConfigError>) {
        match Self::load_from(path) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the user config file.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("dev", "conveyor", "conveyor")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    "yaml" => OutputFormat::Yaml,
                    _ => return Err(invalid()),
                };
            }
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => return Err(invalid()),
                };
            }
            "max_parallel" => {
                self.max_parallel = match value {
                    "none" | "unlimited" => None,
                    n => match n.parse::<usize>() {
                        Ok(0) | Err(_) => return Err(invalid()),
                        Ok(n) => Some(n),
                    },
                };
            }
            "step_timeout_seconds" => {
                self.step_timeout_seconds = match value {
                    "none" => None,
                    n => Some(n.parse().map_err(|_| invalid())?),
                };
            }
            "retry_count" => self.retry_count = value.parse().map_err(|_| invalid())?,
            "skip_actions" => self.skip_actions = value.parse().map_err(|_| invalid())?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}
