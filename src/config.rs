//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, ThermalBridgeError};
use crate::serial::discovery::DEFAULT_PORT_HINTS;
use crate::serial::DEFAULT_BAUD_RATE;
use crate::session::MIN_LOGGING_INTERVAL_S;
use crate::telemetry::export::ExportFormat;
use crate::wire::protocol::{OperatingMode, PidGains};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub setpoint: SetpointConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Port to open; empty means auto-detect
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Descriptor substrings used for auto-detection
    #[serde(default = "default_port_hints")]
    pub port_hints: Vec<String>,
}

/// Session timing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_logging_interval_s")]
    pub logging_interval_s: f64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_stabilization_delay_ms")]
    pub stabilization_delay_ms: u64,

    /// Delay between opening the port and sending the initial mode/disturbance/PID
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,

    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

/// Setpoint soft limits; values outside need explicit confirmation
#[derive(Debug, Deserialize, Clone)]
pub struct SetpointConfig {
    #[serde(default = "default_soft_min")]
    pub soft_min: f64,

    #[serde(default = "default_soft_max")]
    pub soft_max: f64,
}

/// Initial controller values sent on connect
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    #[serde(default)]
    pub mode: OperatingMode,

    #[serde(default)]
    pub disturbance: f64,

    #[serde(default = "default_base_heat_pct")]
    pub base_heat_pct: f64,

    #[serde(default = "default_kp")]
    pub kp: f64,

    #[serde(default = "default_ki")]
    pub ki: f64,

    #[serde(default = "default_kd")]
    pub kd: f64,
}

/// Export configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub dir: String,

    #[serde(default)]
    pub format: ExportFormat,
}

/// Log output configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files; empty disables file logging
    #[serde(default)]
    pub file_dir: String,
}

// Default value functions
fn default_baud_rate() -> u32 { DEFAULT_BAUD_RATE }
fn default_port_hints() -> Vec<String> { DEFAULT_PORT_HINTS.iter().map(|h| h.to_string()).collect() }

fn default_logging_interval_s() -> f64 { 1.0 }
fn default_heartbeat_interval_ms() -> u64 { 1000 }
fn default_stabilization_delay_ms() -> u64 { 2000 }
fn default_handshake_delay_ms() -> u64 { 200 }
fn default_event_channel_capacity() -> usize { 256 }

fn default_soft_min() -> f64 { 20.0 }
fn default_soft_max() -> f64 { 40.0 }

fn default_base_heat_pct() -> f64 { 50.0 }
fn default_kp() -> f64 { 40.0 }
fn default_ki() -> f64 { 1.0 }
fn default_kd() -> f64 { 10.0 }

fn default_export_dir() -> String { "./exports".to_string() }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            port_hints: default_port_hints(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            logging_interval_s: default_logging_interval_s(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stabilization_delay_ms: default_stabilization_delay_ms(),
            handshake_delay_ms: default_handshake_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl Default for SetpointConfig {
    fn default() -> Self {
        Self {
            soft_min: default_soft_min(),
            soft_max: default_soft_max(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::default(),
            disturbance: 0.0,
            base_heat_pct: default_base_heat_pct(),
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: default_export_dir(),
            format: ExportFormat::default(),
        }
    }
}

impl ControllerConfig {
    /// PID gains sent during the connect handshake
    pub fn pid(&self) -> PidGains {
        PidGains {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> ThermalBridgeError {
    ThermalBridgeError::Config(toml::de::Error::custom(message))
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
    /// use thermal_bridge::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text
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
        // Validate baud rate
        if ![9600, 19200, 38400, 57600, 115200, 230400].contains(&self.serial.baud_rate) {
            return Err(invalid("baud_rate must be one of: 9600, 19200, 38400, 57600, 115200, 230400"));
        }

        // Validate timing fields
        if !self.session.logging_interval_s.is_finite()
            || self.session.logging_interval_s < MIN_LOGGING_INTERVAL_S
        {
            return Err(invalid(format!(
                "logging_interval_s must be at least {}",
                MIN_LOGGING_INTERVAL_S
            )));
        }

        if self.session.heartbeat_interval_ms == 0 || self.session.heartbeat_interval_ms > 60000 {
            return Err(invalid("heartbeat_interval_ms must be between 1 and 60000"));
        }

        if self.session.stabilization_delay_ms == 0 || self.session.stabilization_delay_ms > 60000 {
            return Err(invalid("stabilization_delay_ms must be between 1 and 60000"));
        }

        if self.session.handshake_delay_ms > 10000 {
            return Err(invalid("handshake_delay_ms must be at most 10000"));
        }

        if self.session.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity must be greater than 0"));
        }

        // Validate setpoint limits
        if !self.setpoint.soft_min.is_finite()
            || !self.setpoint.soft_max.is_finite()
            || self.setpoint.soft_min >= self.setpoint.soft_max
        {
            return Err(invalid("setpoint soft_min must be less than soft_max"));
        }

        // Validate controller defaults
        if !(10.0..=100.0).contains(&self.controller.base_heat_pct) {
            return Err(invalid("base_heat_pct must be between 10 and 100"));
        }

        for (name, value) in [
            ("disturbance", self.controller.disturbance),
            ("kp", self.controller.kp),
            ("ki", self.controller.ki),
            ("kd", self.controller.kd),
        ] {
            if !value.is_finite() {
                return Err(invalid(format!("{} must be a finite number", name)));
            }
        }

        // Validate export configuration
        if self.export.dir.trim().is_empty() {
            return Err(invalid("export dir cannot be empty"));
        }

        Ok(())
    }
}
