//! # Telemetry Decoder
//!
//! Decodes `DADOS` telemetry frames and parses command lines.

use std::str::FromStr;

use super::protocol::*;
use crate::error::{Result, ThermalBridgeError};

/// Decode a telemetry line
///
/// Frame layout: `DADOS,<temp>,<setpoint>,<lampPWM>,<fanPWM>,<reserved>,<rpm>`.
/// Fields past the fan PWM are optional.
///
/// # Arguments
///
/// * `line` - One received line, with or without its terminator
///
/// # Returns
///
/// * `Option<TelemetrySample>` - Decoded sample, or `None` for anything that is
///   not a well-formed frame
///
/// # Examples
///
/// ```
/// use thermal_bridge::wire::decoder::decode_telemetry;
///
/// let sample = decode_telemetry("DADOS,25.0,30.0,128,0,0,1200").unwrap();
/// assert_eq!(sample.temperature, 25.0);
/// assert_eq!(sample.fan_rpm, 1200);
///
/// assert!(decode_telemetry("DADOS,25.0,30.0").is_none());
/// assert!(decode_telemetry("hello").is_none());
/// ```
pub fn decode_telemetry(line: &str) -> Option<TelemetrySample> {
    let line = line.trim();
    if !line.starts_with(TELEMETRY_TAG) {
        return None;
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < TELEMETRY_MIN_FIELDS {
        return None;
    }

    let temperature = parse_float_field(fields[1])?;
    let setpoint = parse_float_field(fields[2])?;
    let lamp_pwm = parse_float_field(fields[3])?;
    let fan_pwm = parse_float_field(fields[4])?;

    // A present but malformed RPM field rejects the whole frame
    let fan_rpm = match fields.get(TELEMETRY_RPM_FIELD) {
        Some(raw) => raw.trim().parse::<i32>().ok()?,
        None => 0,
    };

    Some(TelemetrySample {
        temperature,
        setpoint,
        lamp_pwm,
        fan_pwm,
        fan_rpm,
    })
}

fn parse_float_field(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

impl FromStr for Command {
    type Err = ThermalBridgeError;

    /// Parse an outbound command line (as written by the encoder)
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_command(s)
    }
}

/// Parse an outbound command line back into a [`Command`]
///
/// Used by device simulators and test fixtures that sit on the other end of
/// the link.
///
/// # Errors
///
/// Returns `ThermalBridgeError::Protocol` when the line is not a known command.
pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.strip_suffix(LINE_TERMINATOR).unwrap_or(line).trim_end_matches('\r');
    let invalid = || ThermalBridgeError::Protocol(format!("Unrecognized command line: {:?}", line));

    match line {
        "STOP" => return Ok(Command::Stop),
        "PING" => return Ok(Command::Heartbeat),
        _ => {}
    }

    let (keyword, argument) = line.split_once(':').ok_or_else(invalid)?;
    let float = |raw: &str| raw.parse::<f64>().map_err(|_| invalid());

    match keyword {
        "MODE" => argument
            .parse::<u8>()
            .ok()
            .and_then(OperatingMode::from_code)
            .map(Command::SetMode)
            .ok_or_else(invalid),
        "DIST" => Ok(Command::SetDisturbance(float(argument)?)),
        "BASE" => argument.parse::<u8>().map(Command::SetBasePwm).map_err(|_| invalid()),
        "SET" => Ok(Command::SetSetpoint(float(argument)?)),
        "PID" => {
            let gains: Vec<&str> = argument.split(':').collect();
            if gains.len() != 3 {
                return Err(invalid());
            }
            Ok(Command::SetPid(PidGains {
                kp: float(gains[0])?,
                ki: float(gains[1])?,
                kd: float(gains[2])?,
            }))
        }
        _ => Err(invalid()),
    }
}
