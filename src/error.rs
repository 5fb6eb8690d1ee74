//! # Error Types
//!
//! Custom error types for Thermal Bridge using `thiserror`.

use thiserror::Error;

/// Main error type for Thermal Bridge
#[derive(Debug, Error)]
pub enum ThermalBridgeError {
    /// The requested serial port could not be opened
    #[error("Serial port unavailable: {port}: {reason}")]
    PortUnavailable { port: String, reason: String },

    /// No candidate serial port was found
    #[error("No serial port found: {0}")]
    SerialPortNotFound(String),

    /// Serial I/O errors other than opening the port
    #[error("Serial error: {0}")]
    Serial(String),

    /// A line that is not a known protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Export errors (empty log, unsupported format)
    #[error("Export error: {0}")]
    Export(String),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Thermal Bridge
pub type Result<T> = std::result::Result<T, ThermalBridgeError>;
