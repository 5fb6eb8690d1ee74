//! # Thermal Bridge
//!
//! Operator console for the thermal plant: connect, pick a mode, run a
//! setpoint, watch the telemetry and export the log.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use thermal_bridge::cli::{self, CliCommand};
use thermal_bridge::config::{Config, LoggingConfig};
use thermal_bridge::runtime::{Intent, SessionHandle, SessionRuntime};
use thermal_bridge::serial::discovery::{select_port, PortEnumerator, SystemPorts};
use thermal_bridge::serial::NativePortOpener;

/// Environment variable naming the config file
const CONFIG_ENV: &str = "THERMAL_BRIDGE_CONFIG";

/// File name prefix of the rolling log
const LOG_FILE_PREFIX: &str = "thermal-bridge.log";

/// Main entry point for the Thermal Bridge console
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, then `THERMAL_BRIDGE_CONFIG`, then defaults)
///    - Set up logging with tracing subscriber
///    - Spawn the session runtime
///
/// 2. **Main Loop**
///    - Read operator commands from stdin and forward them as intents
///    - Handle Ctrl+C for graceful shutdown
///
/// 3. **Graceful Shutdown**
///    - Drop the session handle; the runtime sends `STOP` if a port is open
///
/// # Errors
///
/// Returns error if the configuration cannot be loaded or stdin fails.
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_tracing(&config.logging);

    info!("Thermal Bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    let (runtime, handle) = SessionRuntime::new(NativePortOpener, &config);
    let runtime_task = tokio::spawn(runtime.run());

    println!("{}", cli::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    info!("stdin closed, shutting down...");
                    break;
                };
                if !handle_line(&line, &handle, &config).await {
                    break;
                }
            }

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    drop(handle);
    runtime_task.await.context("session runtime panicked")?;
    info!("Thermal Bridge stopped");
    Ok(())
}

/// Execute one operator line; returns `false` to quit
async fn handle_line(line: &str, handle: &SessionHandle, config: &Config) -> bool {
    let command = match cli::parse_line(line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(e) => {
            println!("{}", e);
            return true;
        }
    };

    let intent = match command {
        CliCommand::Quit => return false,
        CliCommand::Help => {
            println!("{}", cli::HELP);
            return true;
        }
        CliCommand::Status => {
            println!("{}", handle.snapshot());
            return true;
        }
        CliCommand::Ports => {
            list_ports();
            return true;
        }
        CliCommand::Connect { port, interval } => {
            let configured = port.unwrap_or_else(|| config.serial.port.clone());
            match select_port(&SystemPorts, &configured, config.serial.port_hints.as_slice()) {
                Ok(port) => Intent::Connect {
                    port,
                    logging_interval: interval
                        .unwrap_or_else(|| config.session.logging_interval_s.to_string()),
                },
                Err(e) => {
                    println!("{}", e);
                    return true;
                }
            }
        }
        CliCommand::Intent(Intent::Export { path, format }) if path.is_relative() => Intent::Export {
            path: PathBuf::from(&config.export.dir).join(path),
            format,
        },
        CliCommand::Intent(intent) => intent,
    };

    match handle.request(intent).await {
        Ok(()) => println!("ok | {}", handle.snapshot()),
        Err(e) => println!("{}", e),
    }
    true
}

fn list_ports() {
    match SystemPorts.available() {
        Ok(ports) if ports.is_empty() => println!("no serial ports found"),
        Ok(ports) => {
            for port in ports {
                println!("{}  {}", port.name, port.descriptor);
            }
        }
        Err(e) => warn!("Failed to list ports: {}", e),
    }
}

/// Resolve and load the configuration file, if any
fn load_config() -> Result<Config> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);

    match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

/// Install the console subscriber, plus a daily log file when configured
fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if logging.file_dir.trim().is_empty() {
        tracing_subscriber::registry().with(filter).with(console).init();
        return None;
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(&logging.file_dir);

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            tracing_subscriber::registry().with(filter).with(console).with(file).init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter).with(console).init();
            warn!("File logging disabled, cannot use {}: {}", logging.file_dir, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(CONFIG_ENV, "THERMAL_BRIDGE_CONFIG");
        assert!(LOG_FILE_PREFIX.ends_with(".log"));
    }
}
