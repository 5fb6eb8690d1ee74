//! # Record Export
//!
//! Writes a snapshot of the record log to disk as CSV (opens in any
//! spreadsheet) or JSON Lines. Only the columns visible in the session's
//! mode are written.
//!
//! Exports are blocking file I/O; the runtime runs them on the blocking pool.

use serde::Deserialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use super::{export_columns, LogRecord};
use crate::error::{Result, ThermalBridgeError};
use crate::wire::protocol::OperatingMode;

/// Export file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Jsonl,
}

impl ExportFormat {
    /// Guess the format from a path's extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "jsonl" | "json" => Ok(ExportFormat::Jsonl),
            other => Err(format!("unsupported export format '{}'", other)),
        }
    }
}

/// Everything an export needs, detached from the live session
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub records: Vec<LogRecord>,
    pub mode: OperatingMode,
    pub path: PathBuf,
    pub format: ExportFormat,
}

impl ExportJob {
    /// Write the file, returning the number of records written
    ///
    /// # Errors
    ///
    /// Returns `Export` for an empty log, or the underlying I/O/JSON error.
    pub fn run(&self) -> Result<usize> {
        export_records(&self.path, &self.records, self.mode, self.format)
    }
}

/// Write `records` to `path`
///
/// # Errors
///
/// Returns `Export` for an empty log, or the underlying I/O/JSON error.
pub fn export_records(
    path: &Path,
    records: &[LogRecord],
    mode: OperatingMode,
    format: ExportFormat,
) -> Result<usize> {
    if records.is_empty() {
        return Err(ThermalBridgeError::Export("no records to export".to_string()));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut out = BufWriter::new(File::create(path)?);
    match format {
        ExportFormat::Csv => write_csv(&mut out, records, mode)?,
        ExportFormat::Jsonl => write_jsonl(&mut out, records, mode)?,
    }
    out.flush()?;

    info!("Exported {} records to {}", records.len(), path.display());
    Ok(records.len())
}

fn write_csv<W: Write>(out: &mut W, records: &[LogRecord], mode: OperatingMode) -> Result<()> {
    let columns = export_columns(mode);

    let header: Vec<String> = columns.iter().map(|c| csv_field(c.header())).collect();
    writeln!(out, "{}", header.join(","))?;

    for record in records {
        let row: Vec<String> = columns.iter().map(|c| csv_field(&c.render(record))).collect();
        writeln!(out, "{}", row.join(","))?;
    }
    Ok(())
}

fn write_jsonl<W: Write>(out: &mut W, records: &[LogRecord], mode: OperatingMode) -> Result<()> {
    let columns = export_columns(mode);

    for record in records {
        let mut value = serde_json::to_value(record)?;
        if let Some(fields) = value.as_object_mut() {
            fields.retain(|key, _| columns.iter().any(|c| c.key() == key));
        }
        serde_json::to_writer(&mut *out, &value)?;
        writeln!(out)?;
    }
    Ok(())
}

/// Quote a CSV field when it contains a separator, quote or newline
fn csv_field(raw: &str) -> String {
    if raw.contains(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use std::fs;
    use tempfile::tempdir;

    fn record(elapsed_s: f64, event: &str) -> LogRecord {
        LogRecord {
            elapsed_s,
            temperature_c: 25.5,
            setpoint_c: 30.0,
            lamp_voltage: 6.0,
            fan_voltage: 1.5,
            fan_rpm: 1200,
            event: event.to_string(),
            timestamp: Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert_eq!("json".parse::<ExportFormat>(), Ok(ExportFormat::Jsonl));
        assert!("xlsx".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::from_path(Path::new("run.jsonl")), Some(ExportFormat::Jsonl));
        assert_eq!(ExportFormat::from_path(Path::new("run")), None);
    }

    #[test]
    fn test_csv_all_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let records = vec![record(0.0, "INICIO (Set: 30.0)"), record(1.0, "-")];

        let written = export_records(&path, &records, OperatingMode::Auto, ExportFormat::Csv).unwrap();
        assert_eq!(written, 2);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "Time (s),Temperature (°C),Setpoint (°C),Lamp Voltage (V),Fan Voltage (V),RPM,Event,Date/Time"
        );
        assert_eq!(lines[1], "0,25.5,30,6,1.5,1200,INICIO (Set: 30.0),2024-05-01 12:30:00");
        assert_eq!(lines[2], "1,25.5,30,6,1.5,1200,-,2024-05-01 12:30:00");
    }

    #[test]
    fn test_csv_heat_only_drops_fan_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/heat.csv");

        export_records(&path, &[record(0.5, "-")], OperatingMode::HeatOnly, ExportFormat::Csv).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let header = contents.lines().next().unwrap();
        assert!(!header.contains("Fan Voltage"));
        assert!(!header.contains("RPM"));
        assert!(header.ends_with("Event,Date/Time"));
    }

    #[test]
    fn test_jsonl_filters_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.jsonl");

        export_records(&path, &[record(0.0, "-")], OperatingMode::HeatOnly, ExportFormat::Jsonl).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(value["temperature_c"], 25.5);
        assert_eq!(value["timestamp"], "2024-05-01 12:30:00");
        assert!(value.get("fan_rpm").is_none());
        assert!(value.get("fan_voltage").is_none());
    }

    #[test]
    fn test_empty_log_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");

        match export_records(&path, &[], OperatingMode::Auto, ExportFormat::Csv) {
            Err(ThermalBridgeError::Export(_)) => {}
            other => panic!("Expected Export error, got: {:?}", other),
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_job_runs_export() {
        let dir = tempdir().unwrap();
        let job = ExportJob {
            records: vec![record(0.0, "-")],
            mode: OperatingMode::FanOnly,
            path: dir.path().join("job.csv"),
            format: ExportFormat::Csv,
        };
        assert_eq!(job.run().unwrap(), 1);
        assert!(job.path.exists());
    }
}
