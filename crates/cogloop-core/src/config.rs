//! Configuration parsing for the execution engine.
//!
//! Uses the `key=value` format of `.cogloop/config`.
//! Precedence: CLI flags > `--config` file > `.cogloop/config` > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::keys::{StoreKeys, DEFAULT_NAMESPACE};
use crate::types::DEFAULT_MAX_ATTEMPTS;

/// Workspace-relative location of the default config file.
pub const DEFAULT_CONFIG_PATH: &str = ".cogloop/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("{key} must be greater than zero")]
    Zero { key: String },
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Store
    /// Directory every store key is resolved against.
    pub store_root: PathBuf,
    /// First component of every document key.
    pub namespace: String,

    // Artifacts
    pub archive_root: PathBuf,
    pub python_bin: String,

    // Execution
    pub exec_timeout_sec: u32,
    /// Grace period for joining output readers after exit or kill.
    pub io_grace_ms: u64,
    pub max_output_bytes: usize,
    pub check_dangerous: bool,
    /// Mirror child output to the console as it arrives.
    pub echo_output: bool,
    /// Directory for per-execution output logs (disabled when unset).
    pub exec_log_dir: Option<PathBuf>,

    // Queue
    pub default_priority: i32,
    pub retry_priority: i32,
    pub max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("."),
            namespace: DEFAULT_NAMESPACE.to_string(),
            archive_root: PathBuf::from("memory/code_archive"),
            python_bin: "python3".to_string(),
            exec_timeout_sec: 60,
            io_grace_ms: 1000,
            max_output_bytes: 50 * 1024 * 1024,
            check_dangerous: true,
            echo_output: false,
            exec_log_dir: None,
            default_priority: 10,
            retry_priority: 5,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `<workspace_root>/.cogloop/config` if present, else defaults.
    pub fn discover(workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = workspace_root.join(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        self.validate()
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "store_root" => self.store_root = PathBuf::from(value),
            "namespace" => self.namespace = value.to_string(),
            "archive_root" => self.archive_root = PathBuf::from(value),
            "python_bin" => self.python_bin = value.to_string(),
            "exec_timeout_sec" => self.exec_timeout_sec = Self::parse_int(key, value)?,
            "io_grace_ms" => self.io_grace_ms = Self::parse_int(key, value)?,
            "max_output_bytes" => self.max_output_bytes = Self::parse_int(key, value)?,
            "check_dangerous" => self.check_dangerous = Self::parse_bool(key, value)?,
            "echo_output" => self.echo_output = Self::parse_bool(key, value)?,
            "exec_log_dir" => {
                self.exec_log_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "default_priority" => self.default_priority = Self::parse_int(key, value)?,
            "retry_priority" => self.retry_priority = Self::parse_int(key, value)?,
            "max_attempts" => self.max_attempts = Self::parse_int(key, value)?,
            _ => {
                tracing::warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.exec_timeout_sec == 0 {
            return Err(ConfigError::Zero {
                key: "exec_timeout_sec".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                key: "max_attempts".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.store_root.is_relative() {
            self.store_root = workspace_root.join(&self.store_root);
        }
        if self.archive_root.is_relative() {
            self.archive_root = workspace_root.join(&self.archive_root);
        }
        if let Some(ref dir) = self.exec_log_dir {
            if dir.is_relative() {
                self.exec_log_dir = Some(workspace_root.join(dir));
            }
        }
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.exec_timeout_sec))
    }

    pub fn io_grace(&self) -> Duration {
        Duration::from_millis(self.io_grace_ms)
    }

    pub fn keys(&self) -> StoreKeys {
        StoreKeys::new(self.namespace.clone())
    }
}
