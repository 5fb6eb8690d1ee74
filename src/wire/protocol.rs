//! # Wire Protocol Constants and Types
//!
//! Core protocol definitions shared by the encoder and decoder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Leading token of every telemetry frame
pub const TELEMETRY_TAG: &str = "DADOS";

/// Minimum number of comma-separated fields in an accepted telemetry frame
/// (tag, temperature, setpoint, lamp PWM, fan PWM)
pub const TELEMETRY_MIN_FIELDS: usize = 5;

/// Index of the optional fan RPM field
pub const TELEMETRY_RPM_FIELD: usize = 6;

/// Full-scale PWM duty value
pub const PWM_MAX: f64 = 255.0;

/// Supply voltage driving the lamp and fan at 100% duty
pub const SUPPLY_VOLTAGE: f64 = 12.0;

/// Line terminator for outbound commands
pub const LINE_TERMINATOR: char = '\n';

/// Plant operating mode as understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Lamp and fan both regulated
    #[default]
    Auto,
    /// Lamp only
    HeatOnly,
    /// Fan only, against a fixed base heat
    FanOnly,
}

impl OperatingMode {
    /// Numeric code sent in `MODE:<m>`
    pub fn code(self) -> u8 {
        match self {
            OperatingMode::Auto => 0,
            OperatingMode::HeatOnly => 1,
            OperatingMode::FanOnly => 2,
        }
    }

    /// Inverse of [`OperatingMode::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OperatingMode::Auto),
            1 => Some(OperatingMode::HeatOnly),
            2 => Some(OperatingMode::FanOnly),
            _ => None,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatingMode::Auto => "auto",
            OperatingMode::HeatOnly => "heat_only",
            OperatingMode::FanOnly => "fan_only",
        };
        f.write_str(name)
    }
}

impl FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "auto" | "both" => Ok(OperatingMode::Auto),
            "1" | "heat" | "heat_only" => Ok(OperatingMode::HeatOnly),
            "2" | "fan" | "fan_only" => Ok(OperatingMode::FanOnly),
            other => Err(format!("unknown operating mode '{}'", other)),
        }
    }
}

/// PID coefficients forwarded to the firmware
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// Outbound command.
///
/// Every message the host ever sends is one of these variants; see
/// [`crate::wire::encoder::encode_command`] for the exact line formats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// `MODE:<m>`
    SetMode(OperatingMode),
    /// `DIST:<v>`
    SetDisturbance(f64),
    /// `BASE:<p>`
    SetBasePwm(u8),
    /// `SET:<v>`
    SetSetpoint(f64),
    /// `PID:<kp>:<ki>:<kd>`
    SetPid(PidGains),
    /// `STOP`
    Stop,
    /// `PING`
    Heartbeat,
}

/// One decoded telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// Plant temperature in °C
    pub temperature: f64,

    /// Setpoint currently held by the firmware in °C
    pub setpoint: f64,

    /// Lamp duty (0-255) as reported
    pub lamp_pwm: f64,

    /// Fan duty (0-255) as reported
    pub fan_pwm: f64,

    /// Fan speed, 0 when the frame carries no RPM field
    pub fan_rpm: i32,
}

impl TelemetrySample {
    /// Lamp drive voltage derived from the duty value
    pub fn lamp_voltage(&self) -> f64 {
        pwm_to_voltage(self.lamp_pwm)
    }

    /// Fan drive voltage derived from the duty value
    pub fn fan_voltage(&self) -> f64 {
        pwm_to_voltage(self.fan_pwm)
    }
}

/// Convert a 0-255 duty value to the voltage seen by the load
pub fn pwm_to_voltage(pwm: f64) -> f64 {
    pwm / PWM_MAX * SUPPLY_VOLTAGE
}

/// Convert a 0-255 duty value to a whole percentage (truncated)
pub fn pwm_to_percent(pwm: f64) -> u8 {
    (pwm / PWM_MAX * 100.0).clamp(0.0, 255.0) as u8
}
