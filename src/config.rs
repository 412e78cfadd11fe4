//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{LoggerLinkError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Data logger endpoint configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LinkConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

/// Reconnect policy configuration
///
/// `max_attempts = 0` retries forever. `initial_delay_ms = 0` reconnects
/// without any pause between attempts.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_always_reconnect")]
    pub always_reconnect: bool,

    #[serde(default)]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Status polling configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

/// Raw inbound byte capture
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_byte_log_enabled")]
    pub byte_log_enabled: bool,

    #[serde(default = "default_byte_log_path")]
    pub byte_log_path: String,
}

/// Application log output
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; stderr when unset
    #[serde(default)]
    pub file_dir: Option<String>,
}

// Default value functions
fn default_host() -> String { "192.168.4.1".to_string() }
fn default_port() -> u16 { 123 }
fn default_connect_timeout_ms() -> u64 { 3000 }
fn default_io_timeout_ms() -> u64 { 3000 }

fn default_always_reconnect() -> bool { true }
fn default_initial_delay_ms() -> u64 { 250 }
fn default_max_delay_ms() -> u64 { 5000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

fn default_poll_interval_ms() -> u64 { 500 }

fn default_byte_log_enabled() -> bool { true }
fn default_byte_log_path() -> String { "./log".to_string() }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            always_reconnect: default_always_reconnect(),
            max_attempts: 0,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_ms: default_poll_interval_ms() }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            byte_log_enabled: default_byte_log_enabled(),
            byte_log_path: default_byte_log_path(),
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use logger_link::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.link.host.is_empty() {
            return Err(invalid("link host cannot be empty"));
        }

        if self.link.port == 0 {
            return Err(invalid("link port must be non-zero"));
        }

        if self.link.connect_timeout_ms == 0 || self.link.connect_timeout_ms > 60000 {
            return Err(invalid("connect_timeout_ms must be between 1 and 60000"));
        }

        if self.link.io_timeout_ms == 0 || self.link.io_timeout_ms > 60000 {
            return Err(invalid("io_timeout_ms must be between 1 and 60000"));
        }

        if self.reconnect.max_delay_ms > 600_000 {
            return Err(invalid("max_delay_ms must be at most 600000"));
        }

        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(invalid("initial_delay_ms must not exceed max_delay_ms"));
        }

        let multiplier = self.reconnect.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(invalid("backoff_multiplier must be at least 1.0"));
        }

        if self.poll.interval_ms < 10 || self.poll.interval_ms > 60000 {
            return Err(invalid("poll interval_ms must be between 10 and 60000"));
        }

        if self.diagnostics.byte_log_enabled && self.diagnostics.byte_log_path.is_empty() {
            return Err(invalid("byte_log_path cannot be empty when byte log is enabled"));
        }

        if matches!(self.logging.file_dir.as_deref(), Some("")) {
            return Err(invalid("logging file_dir cannot be empty"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> LoggerLinkError {
    LoggerLinkError::Config(toml::de::Error::custom(msg))
}
