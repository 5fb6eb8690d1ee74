//! # Command Encoder
//!
//! Encodes [`Command`] values into protocol lines.

use super::protocol::*;

/// Encode a command into a complete protocol line
///
/// # Arguments
///
/// * `command` - Command to encode
///
/// # Returns
///
/// * `String` - Line including the trailing `\n`
///
/// # Examples
///
/// ```
/// use thermal_bridge::wire::encoder::encode_command;
/// use thermal_bridge::wire::protocol::{Command, OperatingMode};
///
/// assert_eq!(encode_command(&Command::SetMode(OperatingMode::FanOnly)), "MODE:2\n");
/// assert_eq!(encode_command(&Command::SetSetpoint(30.0)), "SET:30.0\n");
/// ```
pub fn encode_command(command: &Command) -> String {
    let mut line = match command {
        Command::SetMode(mode) => format!("MODE:{}", mode.code()),
        Command::SetDisturbance(value) => format!("DIST:{}", format_number(*value)),
        Command::SetBasePwm(pwm) => format!("BASE:{}", pwm),
        Command::SetSetpoint(value) => format!("SET:{}", format_number(*value)),
        Command::SetPid(gains) => format!(
            "PID:{}:{}:{}",
            format_number(gains.kp),
            format_number(gains.ki),
            format_number(gains.kd)
        ),
        Command::Stop => "STOP".to_string(),
        Command::Heartbeat => "PING".to_string(),
    };
    line.push(LINE_TERMINATOR);
    line
}

/// Render a float the way the firmware expects it
///
/// Shortest round-trip representation that always keeps a fractional part
/// for whole numbers (`30.0`, not `30`). Magnitudes below `1e-4` or from
/// `1e16` up use exponent notation with a sign and at least two exponent
/// digits (`1e+16`, `1.5e-07`).
pub fn format_number(value: f64) -> String {
    let repr = format!("{:?}", value);
    match repr.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => repr,
    }
}
