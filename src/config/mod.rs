//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hub::{Channel, DEFAULT_QUEUE_SIZE};
use crate::serial::SerialConnectionConfig;
use crate::telemetry::fields::HISTORY_LIMIT;
use crate::telemetry::publisher::TELEMETRY_CHANNELS;
use crate::telemetry::throttle::DEFAULT_THROTTLE_MS;
use crate::telemetry::TelemetrySettings;

pub const DEFAULT_HUB_PORT: u16 = 8787;

/// Relay listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    /// Frames queued per connection before new ones are dropped
    pub queue_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_HUB_PORT,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl HubConfig {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How snapshots reach the hub
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Direct call into the hub running in this process
    InProcess,
    /// One short-lived socket per channel and snapshot
    EphemeralSocket,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub channels: Vec<Channel>,
    pub throttle_ms: u64,
    pub history_limit: usize,
    pub trailing_flush: bool,
    pub publish_mode: PublishMode,
    pub connect_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channels: TELEMETRY_CHANNELS.to_vec(),
            throttle_ms: DEFAULT_THROTTLE_MS,
            history_limit: HISTORY_LIMIT,
            trailing_flush: false,
            publish_mode: PublishMode::InProcess,
            connect_timeout_ms: 2000,
        }
    }
}

impl TelemetryConfig {
    pub fn settings(&self) -> TelemetrySettings {
        TelemetrySettings {
            throttle: Duration::from_millis(self.throttle_ms),
            history_limit: self.history_limit.max(1),
            trailing_flush: self.trailing_flush,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Path the configuration was loaded from
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Open the serial device right after startup
    pub auto_open: bool,

    pub hub: HubConfig,
    pub telemetry: TelemetryConfig,
    pub serial: SerialConnectionConfig,
}

impl AppConfig {
    /// Load from `path`, or the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            log::info!(
                "No config at {}, using defaults",
                config_path.display()
            );
            return Ok(Self {
                config_path,
                ..Self::default()
            });
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        let mut config = Self::from_toml(&contents)?;
        config.config_path = config_path;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config file")?;
        if config.serial.baud_rate == 0 {
            anyhow::bail!("serial.baudRate must be positive");
        }
        Ok(config)
    }

    /// Save configuration to `config_path`
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("overlay-telemetry")
            .join("config.toml")
    }
}
