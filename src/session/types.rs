//! Session-level value types.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lowest accepted logging interval in seconds
pub const MIN_LOGGING_INTERVAL_S: f64 = 0.1;

/// Interval used when the requested one is missing, invalid or too small
pub const DEFAULT_LOGGING_INTERVAL_S: f64 = 1.0;

/// Whether the serial link is up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

/// Where the session is in a setpoint run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Connected, no setpoint submitted yet
    Idle,
    /// Setpoint accepted, grace period running
    Stabilizing,
    /// Setpoint active
    Running,
    /// Stopped or link lost; terminal until the next connect
    Stopped,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Stabilizing => "stabilizing",
            RunPhase::Running => "running",
            RunPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Inputs the operator may not edit in the current state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InputLocks {
    pub mode: bool,
    pub setpoint: bool,
    pub base_heat: bool,
    pub logging_interval: bool,
}

/// Minimum time between two log records
///
/// Always at least [`MIN_LOGGING_INTERVAL_S`]; anything else falls back to
/// [`DEFAULT_LOGGING_INTERVAL_S`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoggingInterval(f64);

impl LoggingInterval {
    /// Coerce a number of seconds
    pub fn from_secs(secs: f64) -> Self {
        if secs.is_finite() && secs >= MIN_LOGGING_INTERVAL_S {
            Self(secs)
        } else {
            Self(DEFAULT_LOGGING_INTERVAL_S)
        }
    }

    /// Coerce operator input; a decimal comma is accepted
    pub fn parse(input: &str) -> Self {
        match parse_decimal(input) {
            Some(secs) => Self::from_secs(secs),
            None => Self(DEFAULT_LOGGING_INTERVAL_S),
        }
    }

    pub fn as_secs(&self) -> f64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs_f64(self.0)
    }
}

impl Default for LoggingInterval {
    fn default() -> Self {
        Self(DEFAULT_LOGGING_INTERVAL_S)
    }
}

/// Parse operator-entered decimal text
///
/// Accepts `,` as the decimal separator. Blank, non-numeric and non-finite
/// input yields `None`.
pub fn parse_decimal(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Handle for a pending stabilization timer
///
/// Only the ticket of the current run can complete stabilization, so a
/// timer left over from a stopped run is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilizationTicket {
    pub(crate) run_id: u64,
}

/// Transition rejected by the session state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No open link
    #[error("not connected")]
    NotConnected,

    /// Operation only legal while idle
    #[error("a run is active ({0}); stop it first")]
    RunActive(RunPhase),

    /// The input is locked in the current state
    #[error("{0} input is locked")]
    InputLocked(&'static str),

    /// Fan-only run attempted without confirming the base heat
    #[error("confirm the base heat before starting a fan-only run")]
    BaseHeatUnconfirmed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_interval_valid() {
        assert_eq!(LoggingInterval::parse("2.5").as_secs(), 2.5);
        assert_eq!(LoggingInterval::parse("0.1").as_secs(), 0.1);
        assert_eq!(LoggingInterval::parse(" 0,5 ").as_secs(), 0.5);
    }

    #[test]
    fn test_logging_interval_below_floor_falls_back() {
        assert_eq!(LoggingInterval::parse("0.01").as_secs(), 1.0);
        assert_eq!(LoggingInterval::parse("0").as_secs(), 1.0);
        assert_eq!(LoggingInterval::parse("-3").as_secs(), 1.0);
        assert_eq!(LoggingInterval::from_secs(0.09).as_secs(), 1.0);
    }

    #[test]
    fn test_logging_interval_invalid_falls_back() {
        assert_eq!(LoggingInterval::parse("").as_secs(), 1.0);
        assert_eq!(LoggingInterval::parse("fast").as_secs(), 1.0);
        assert_eq!(LoggingInterval::parse("inf").as_secs(), 1.0);
        assert_eq!(LoggingInterval::from_secs(f64::NAN).as_secs(), 1.0);
    }

    #[test]
    fn test_logging_interval_duration() {
        assert_eq!(LoggingInterval::parse("1.5").as_duration(), Duration::from_millis(1500));
        assert_eq!(LoggingInterval::default().as_secs(), DEFAULT_LOGGING_INTERVAL_S);
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("30"), Some(30.0));
        assert_eq!(parse_decimal("30,5"), Some(30.5));
        assert_eq!(parse_decimal("-1.25"), Some(-1.25));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("   "), None);
        assert_eq!(parse_decimal("1.2.3"), None);
        assert_eq!(parse_decimal("NaN"), None);
    }
}
