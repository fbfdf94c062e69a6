// Configuration management for the sigmux CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/sigmux/config.json
// - Linux: ~/.config/sigmux/config.json
// - Windows: %APPDATA%\sigmux\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sigmux_core::ReceiveOptions;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Override for the account data directory
    pub data_dir: Option<String>,

    /// Fallback log filter when RUST_LOG is unset
    pub log_level: String,

    /// Write a daily rolling log file here when set
    pub log_dir: Option<String>,

    /// Receive loop settings
    pub receive: ReceiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Seconds to wait for the next envelope
    pub timeout_secs: u64,

    /// Stop at the first read timeout
    pub return_on_timeout: bool,

    /// Skip attachment downloads
    pub ignore_attachments: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: "info".to_string(),
            log_dir: None,
            receive: ReceiveConfig::default(),
        }
    }
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            return_on_timeout: false,
            ignore_attachments: false,
        }
    }
}

impl ReceiveConfig {
    pub fn to_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            return_on_timeout: self.return_on_timeout,
            ignore_attachments: self.ignore_attachments,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("sigmux");

        std::fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Account data root: the configured override or the platform default
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .context("Failed to determine data directory")?
                .join("sigmux"),
        };

        std::fs::create_dir_all(&data_dir)
            .context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents = std::fs::read_to_string(&config_file)
                .context("Failed to read config file")?;
            let config: Config = serde_json::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(&config_file, contents)
            .context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value without saving
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = optional(value),
            "log_level" => self.log_level = value.to_string(),
            "log_dir" => self.log_dir = optional(value),
            "receive.timeout_secs" => {
                self.receive.timeout_secs = value.parse()
                    .context("Invalid number of seconds")?;
            }
            "receive.return_on_timeout" => {
                self.receive.return_on_timeout = value.parse()
                    .context("Invalid boolean value")?;
            }
            "receive.ignore_attachments" => {
                self.receive.ignore_attachments = value.parse()
                    .context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Set a config value and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "data_dir" => self.data_dir.clone(),
            "log_level" => Some(self.log_level.clone()),
            "log_dir" => self.log_dir.clone(),
            "receive.timeout_secs" => Some(self.receive.timeout_secs.to_string()),
            "receive.return_on_timeout" => Some(self.receive.return_on_timeout.to_string()),
            "receive.ignore_attachments" => Some(self.receive.ignore_attachments.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("data_dir".to_string(), self.data_dir.clone().unwrap_or_else(|| "(auto)".to_string())),
            ("log_level".to_string(), self.log_level.clone()),
            ("log_dir".to_string(), self.log_dir.clone().unwrap_or_else(|| "(none)".to_string())),
            ("receive.timeout_secs".to_string(), format!("{}s", self.receive.timeout_secs)),
            ("receive.return_on_timeout".to_string(), self.receive.return_on_timeout.to_string()),
            ("receive.ignore_attachments".to_string(), self.receive.ignore_attachments.to_string()),
        ]
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
