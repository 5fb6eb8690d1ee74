//! # Telemetry Module
//!
//! Turns decoded frames into the live view, the append-only record log and
//! the plotted series.
//!
//! This module handles:
//! - Refreshing the latest reading on every frame
//! - Applying the logging filter (monitoring, valid temperature, interval)
//! - Building immutable [`LogRecord`]s and the (elapsed, temperature, setpoint) series
//! - Selecting the visible column set for the current mode
//! - Exporting the log to CSV or JSONL ([`export`])

pub mod export;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::time::Instant;
use tracing::debug;

use crate::session::SessionState;
use crate::wire::protocol::{pwm_to_percent, OperatingMode, TelemetrySample};

/// Wall-clock format used for record timestamps
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Latest reading, refreshed on every decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiveReading {
    pub temperature: f64,
    pub setpoint: f64,
    pub lamp_percent: u8,
    pub fan_percent: u8,
    pub lamp_voltage: f64,
    pub fan_voltage: f64,
    pub fan_rpm: i32,
}

impl From<&TelemetrySample> for LiveReading {
    fn from(sample: &TelemetrySample) -> Self {
        Self {
            temperature: sample.temperature,
            setpoint: sample.setpoint,
            lamp_percent: pwm_to_percent(sample.lamp_pwm),
            fan_percent: pwm_to_percent(sample.fan_pwm),
            lamp_voltage: sample.lamp_voltage(),
            fan_voltage: sample.fan_voltage(),
            fan_rpm: sample.fan_rpm,
        }
    }
}

/// One logged sample
///
/// Records are only handed out by shared reference or as clones; the log
/// itself never changes a record after appending it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Seconds since the session started (2 decimals)
    pub elapsed_s: f64,

    pub temperature_c: f64,

    pub setpoint_c: f64,

    /// Lamp voltage (2 decimals)
    pub lamp_voltage: f64,

    /// Fan voltage (2 decimals)
    pub fan_voltage: f64,

    pub fan_rpm: i32,

    /// Event marker, `"-"` when none
    pub event: String,

    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Local>,
}

fn serialize_timestamp<S: Serializer>(
    timestamp: &DateTime<Local>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&timestamp.format(TIMESTAMP_FORMAT))
}

/// Point on the temperature plot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub elapsed_s: f64,
    pub temperature_c: f64,
    pub setpoint_c: f64,
}

/// A column of the record table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Elapsed,
    Temperature,
    Setpoint,
    LampVoltage,
    FanVoltage,
    FanRpm,
    Event,
    Timestamp,
}

const DISPLAY_COLUMNS_HEAT_ONLY: &[Column] = &[
    Column::Elapsed,
    Column::Temperature,
    Column::Setpoint,
    Column::LampVoltage,
    Column::Event,
];

const DISPLAY_COLUMNS_ALL: &[Column] = &[
    Column::Elapsed,
    Column::Temperature,
    Column::Setpoint,
    Column::LampVoltage,
    Column::FanVoltage,
    Column::FanRpm,
    Column::Event,
];

const EXPORT_COLUMNS_HEAT_ONLY: &[Column] = &[
    Column::Elapsed,
    Column::Temperature,
    Column::Setpoint,
    Column::LampVoltage,
    Column::Event,
    Column::Timestamp,
];

const EXPORT_COLUMNS_ALL: &[Column] = &[
    Column::Elapsed,
    Column::Temperature,
    Column::Setpoint,
    Column::LampVoltage,
    Column::FanVoltage,
    Column::FanRpm,
    Column::Event,
    Column::Timestamp,
];

impl Column {
    /// Field name in serialized records
    pub fn key(self) -> &'static str {
        match self {
            Column::Elapsed => "elapsed_s",
            Column::Temperature => "temperature_c",
            Column::Setpoint => "setpoint_c",
            Column::LampVoltage => "lamp_voltage",
            Column::FanVoltage => "fan_voltage",
            Column::FanRpm => "fan_rpm",
            Column::Event => "event",
            Column::Timestamp => "timestamp",
        }
    }

    /// Human readable header
    pub fn header(self) -> &'static str {
        match self {
            Column::Elapsed => "Time (s)",
            Column::Temperature => "Temperature (°C)",
            Column::Setpoint => "Setpoint (°C)",
            Column::LampVoltage => "Lamp Voltage (V)",
            Column::FanVoltage => "Fan Voltage (V)",
            Column::FanRpm => "RPM",
            Column::Event => "Event",
            Column::Timestamp => "Date/Time",
        }
    }

    /// Render a record's value for this column
    pub fn render(self, record: &LogRecord) -> String {
        match self {
            Column::Elapsed => record.elapsed_s.to_string(),
            Column::Temperature => record.temperature_c.to_string(),
            Column::Setpoint => record.setpoint_c.to_string(),
            Column::LampVoltage => record.lamp_voltage.to_string(),
            Column::FanVoltage => record.fan_voltage.to_string(),
            Column::FanRpm => record.fan_rpm.to_string(),
            Column::Event => record.event.clone(),
            Column::Timestamp => record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Columns shown in the live table; heat-only hides the fan columns
pub fn display_columns(mode: OperatingMode) -> &'static [Column] {
    match mode {
        OperatingMode::HeatOnly => DISPLAY_COLUMNS_HEAT_ONLY,
        OperatingMode::Auto | OperatingMode::FanOnly => DISPLAY_COLUMNS_ALL,
    }
}

/// Columns written on export; the display set plus the wall-clock timestamp
pub fn export_columns(mode: OperatingMode) -> &'static [Column] {
    match mode {
        OperatingMode::HeatOnly => EXPORT_COLUMNS_HEAT_ONLY,
        OperatingMode::Auto | OperatingMode::FanOnly => EXPORT_COLUMNS_ALL,
    }
}

/// Round to two decimals
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Consumes decoded frames for one session
#[derive(Debug, Default)]
pub struct TelemetrySampler {
    live: Option<LiveReading>,
    records: Vec<LogRecord>,
    series: Vec<SeriesPoint>,
}

impl TelemetrySampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the live reading, log and series (new connection)
    pub fn reset(&mut self) {
        self.live = None;
        self.records.clear();
        self.series.clear();
    }

    /// Ingest one frame
    ///
    /// The live reading is always refreshed. A record is appended only if the
    /// session admits it; the appended record is returned.
    pub fn ingest(
        &mut self,
        sample: &TelemetrySample,
        session: &mut SessionState,
        now: Instant,
        wall_clock: DateTime<Local>,
    ) -> Option<&LogRecord> {
        self.live = Some(LiveReading::from(sample));

        let stamp = session.admit_record(sample.temperature, now)?;
        let elapsed_s = stamp.elapsed.as_secs_f64();

        self.records.push(LogRecord {
            elapsed_s: round2(elapsed_s),
            temperature_c: sample.temperature,
            setpoint_c: sample.setpoint,
            lamp_voltage: round2(sample.lamp_voltage()),
            fan_voltage: round2(sample.fan_voltage()),
            fan_rpm: sample.fan_rpm,
            event: stamp.event,
            timestamp: wall_clock,
        });
        self.series.push(SeriesPoint {
            elapsed_s,
            temperature_c: sample.temperature,
            setpoint_c: sample.setpoint,
        });

        debug!("Logged record #{} at {:.1}s: {}°C", self.records.len(), elapsed_s, sample.temperature);
        self.records.last()
    }

    pub fn live(&self) -> Option<LiveReading> {
        self.live
    }

    /// The ordered record log
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// The plotted series, one point per record
    pub fn series(&self) -> &[SeriesPoint] {
        &self.series
    }
}
