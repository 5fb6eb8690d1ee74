//! # Command Dispatcher Module
//!
//! Validates operator intents against the session state and the safety
//! rules, then hands the resulting commands to the open link.
//!
//! This module handles:
//! - Opening and closing the link, and the connect handshake
//! - Parsing operator-entered numbers (decimal comma accepted)
//! - The fan-only base heat gate and the soft setpoint range
//! - Routing reader events into the telemetry sampler
//! - Building read-only snapshots for display collaborators
//!
//! Nothing here schedules timers; the runtime does that with the values
//! returned from [`CommandDispatcher::connect`] and
//! [`CommandDispatcher::submit_setpoint`].

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::serial::{LinkEvent, PortOpener, SerialLink};
use crate::session::{
    parse_decimal, ConnectionStatus, InputLocks, LoggingInterval, RunPhase, SessionError,
    SessionState, StabilizationTicket,
};
use crate::telemetry::export::{ExportFormat, ExportJob};
use crate::telemetry::{display_columns, Column, LiveReading, LogRecord, SeriesPoint, TelemetrySampler};
use crate::wire::decoder::decode_telemetry;
use crate::wire::protocol::{Command, OperatingMode, PidGains};

/// Outcome of a rejected intent
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// Operator input is not a number
    #[error("invalid {field}: '{input}' is not a number")]
    Validation { field: &'static str, input: String },

    /// Fan-only run without a confirmed base heat
    #[error("confirm the base heat before starting a fan-only run")]
    SafetyGate,

    #[error("not connected")]
    NotConnected,

    /// Setpoint outside the soft range; resubmit with confirmation to proceed
    #[error("setpoint {value}°C is outside {min}-{max}°C; resubmit to confirm")]
    ConfirmationRequired { value: f64, min: f64, max: f64 },

    /// Mode change outside the idle phase
    #[error("a run is active ({0}); stop it first")]
    RunActive(RunPhase),

    #[error("{0} input is locked")]
    InputLocked(&'static str),

    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("export unavailable: {0}")]
    ExportUnavailable(&'static str),

    #[error("export failed: {0}")]
    Export(String),

    /// The runtime task is gone
    #[error("session runtime has stopped")]
    RuntimeStopped,
}

impl From<SessionError> for DispatchError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConnected => DispatchError::NotConnected,
            SessionError::RunActive(phase) => DispatchError::RunActive(phase),
            SessionError::InputLocked(input) => DispatchError::InputLocked(input),
            SessionError::BaseHeatUnconfirmed => DispatchError::SafetyGate,
        }
    }
}

/// Static dispatcher settings taken from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub baud_rate: u32,
    pub soft_min: f64,
    pub soft_max: f64,
    pub initial_mode: OperatingMode,
    /// Disturbance sent during the connect handshake
    pub disturbance: f64,
    /// Base heat confirmed when the operator gives no value
    pub base_heat_pct: f64,
    /// PID gains sent during the connect handshake
    pub pid: PidGains,
    pub export_format: ExportFormat,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            baud_rate: config.serial.baud_rate,
            soft_min: config.setpoint.soft_min,
            soft_max: config.setpoint.soft_max,
            initial_mode: config.controller.mode,
            disturbance: config.controller.disturbance,
            base_heat_pct: config.controller.base_heat_pct,
            pid: config.controller.pid(),
            export_format: config.export.format,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Read-only view of the session for display collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionStatus,
    pub port: Option<String>,
    /// The operator's selected mode
    pub mode: OperatingMode,
    /// `None` before the first connect
    pub phase: Option<RunPhase>,
    pub monitoring: bool,
    pub base_heat_confirmed: bool,
    pub base_heat_percent: Option<f64>,
    pub setpoint: Option<f64>,
    pub disturbance: Option<f64>,
    pub current_pid: Option<PidGains>,
    pub logging_interval_s: Option<f64>,
    pub locks: InputLocks,
    pub live: Option<LiveReading>,
    pub record_count: usize,
    pub last_record: Option<LogRecord>,
    /// Shared with the dispatcher; replaced only when a record is appended
    pub series: Arc<[SeriesPoint]>,
    pub columns: &'static [Column],
    pub export_available: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionStatus::Disconnected,
            port: None,
            mode: OperatingMode::default(),
            phase: None,
            monitoring: false,
            base_heat_confirmed: true,
            base_heat_percent: None,
            setpoint: None,
            disturbance: None,
            current_pid: None,
            logging_interval_s: None,
            locks: InputLocks::default(),
            live: None,
            record_count: 0,
            last_record: None,
            series: Arc::from(Vec::new()),
            columns: display_columns(OperatingMode::default()),
            export_available: false,
        }
    }
}

impl fmt::Display for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.port, self.connection) {
            (Some(port), ConnectionStatus::Connected) => write!(f, "connected to {}", port)?,
            _ => f.write_str("disconnected")?,
        }
        write!(f, " | mode {}", self.mode)?;
        if let Some(phase) = self.phase {
            write!(f, " | {}", phase)?;
        }
        if let Some(live) = &self.live {
            write!(
                f,
                " | {:.2}°C (set {:.2}) lamp {}% fan {}% {} rpm",
                live.temperature, live.setpoint, live.lamp_percent, live.fan_percent, live.fan_rpm
            )?;
        }
        if let Some(pid) = self.current_pid {
            write!(f, " | PID {}/{}/{}", pid.kp, pid.ki, pid.kd)?;
        }
        write!(f, " | {} records", self.record_count)?;
        if self.export_available {
            f.write_str(" (export ready)")?;
        }
        Ok(())
    }
}

/// Parse a numeric input field
fn parse_field(field: &'static str, input: &str) -> Result<f64, DispatchError> {
    parse_decimal(input).ok_or_else(|| DispatchError::Validation {
        field,
        input: input.trim().to_string(),
    })
}

/// Validates intents and drives the link for one operator
pub struct CommandDispatcher<O: PortOpener> {
    opener: O,
    settings: DispatcherSettings,
    events: mpsc::Sender<LinkEvent>,
    link: Option<SerialLink>,
    next_link_id: u64,
    session: Option<SessionState>,
    sampler: TelemetrySampler,
    series: Arc<[SeriesPoint]>,
    selected_mode: OperatingMode,
}

impl<O: PortOpener> CommandDispatcher<O> {
    /// Create a dispatcher; link events of every opened link go to `events`
    pub fn new(opener: O, settings: DispatcherSettings, events: mpsc::Sender<LinkEvent>) -> Self {
        let selected_mode = settings.initial_mode;
        Self {
            opener,
            settings,
            events,
            link: None,
            next_link_id: 0,
            session: None,
            sampler: TelemetrySampler::new(),
            series: Arc::from(Vec::new()),
            selected_mode,
        }
    }

    /// Open `port` and start a fresh session
    ///
    /// The previous session's log is discarded. The caller schedules the
    /// handshake for the returned link id.
    ///
    /// # Arguments
    ///
    /// * `port` - Port identifier to open
    /// * `logging_interval` - Operator input; invalid or too small values become 1.0 s
    /// * `now` - Session start time
    ///
    /// # Errors
    ///
    /// * `AlreadyConnected` while a link is open
    /// * `PortUnavailable` if the port cannot be opened
    pub fn connect(
        &mut self,
        port: &str,
        logging_interval: &str,
        now: Instant,
    ) -> Result<u64, DispatchError> {
        if let Some(link) = &self.link {
            return Err(DispatchError::AlreadyConnected(link.port_name().to_string()));
        }

        let port = port.trim();
        if port.is_empty() {
            return Err(DispatchError::PortUnavailable("no port selected".to_string()));
        }

        let stream = self
            .opener
            .open(port, self.settings.baud_rate)
            .map_err(|e| DispatchError::PortUnavailable(e.to_string()))?;

        self.next_link_id += 1;
        let link_id = self.next_link_id;
        self.link = Some(SerialLink::from_stream(stream, port, link_id, self.events.clone()));

        self.sampler.reset();
        self.series = Arc::from(Vec::new());
        self.session = Some(SessionState::connect(
            self.selected_mode,
            LoggingInterval::parse(logging_interval),
            now,
        ));

        info!("Connected to {} at {} baud", port, self.settings.baud_rate);
        Ok(link_id)
    }

    /// Send the initial mode, disturbance and PID gains
    ///
    /// Does nothing if `link_id` is no longer the open link.
    pub async fn handshake(&mut self, link_id: u64) {
        if self.current_link_id() != Some(link_id) {
            debug!("Skipping handshake for stale link {}", link_id);
            return;
        }

        let disturbance = self.settings.disturbance;
        let pid = self.settings.pid;
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let mut commands = vec![Command::SetMode(session.mode())];
        commands.extend(session.set_disturbance(disturbance).ok());
        commands.extend(session.set_pid(pid).ok());

        for command in &commands {
            self.transmit(command).await;
        }
        debug!("Handshake sent on link {}", link_id);
    }

    /// Select the operating mode
    ///
    /// While disconnected only the selection changes; it applies to the
    /// next connect.
    ///
    /// # Errors
    ///
    /// * `RunActive` unless the connected session is idle
    pub async fn change_mode(&mut self, mode: OperatingMode) -> Result<(), DispatchError> {
        let command = match self.session.as_mut() {
            Some(session) if session.is_connected() => Some(session.change_mode(mode)?),
            _ => None,
        };

        self.selected_mode = mode;
        if let Some(command) = command {
            self.transmit(&command).await;
        }
        Ok(())
    }

    /// Confirm the base heat for fan-only runs
    ///
    /// Blank input confirms the configured default percentage.
    ///
    /// # Errors
    ///
    /// * `NotConnected` if the link is down
    /// * `Validation` if `input` is not a number
    /// * `InputLocked` if already confirmed or a run is active
    pub async fn confirm_base_heat(&mut self, input: &str) -> Result<(), DispatchError> {
        let default_percent = self.settings.base_heat_pct;
        let session = self.connected_session()?;
        let percent = if input.trim().is_empty() {
            default_percent
        } else {
            parse_field("base heat", input)?
        };
        let command = session.confirm_base_heat(percent)?;
        self.transmit(&command).await;
        Ok(())
    }

    /// Start a setpoint run
    ///
    /// Checks, in order: connected, setpoint input unlocked, numeric input,
    /// fan-only base heat gate, soft range (skipped when `confirmed`). On
    /// success the mode and setpoint are sent and the caller must schedule
    /// the returned stabilization ticket.
    ///
    /// # Errors
    ///
    /// * `NotConnected`, `InputLocked`, `Validation`, `SafetyGate`
    /// * `ConfirmationRequired` for an unconfirmed value outside the soft range
    pub async fn submit_setpoint(
        &mut self,
        input: &str,
        confirmed: bool,
    ) -> Result<StabilizationTicket, DispatchError> {
        let (soft_min, soft_max) = (self.settings.soft_min, self.settings.soft_max);
        let session = self.connected_session()?;

        if session.locks().setpoint {
            return Err(DispatchError::InputLocked("setpoint"));
        }

        let value = parse_field("setpoint", input)?;

        if session.mode() == OperatingMode::FanOnly && !session.base_heat_confirmed() {
            return Err(DispatchError::SafetyGate);
        }

        if !confirmed && !(soft_min..=soft_max).contains(&value) {
            return Err(DispatchError::ConfirmationRequired {
                value,
                min: soft_min,
                max: soft_max,
            });
        }

        let (commands, ticket) = session.begin_run(value)?;
        for command in &commands {
            self.transmit(command).await;
        }
        Ok(ticket)
    }

    /// End the stabilization grace period for `ticket`
    ///
    /// Returns `false` when the ticket is stale.
    pub fn finish_stabilization(&mut self, ticket: StabilizationTicket) -> bool {
        self.session
            .as_mut()
            .is_some_and(|session| session.finish_stabilization(ticket))
    }

    /// Send a disturbance value
    ///
    /// # Errors
    ///
    /// * `NotConnected` if the link is down
    /// * `Validation` if `input` is not a number
    pub async fn send_disturbance(&mut self, input: &str) -> Result<(), DispatchError> {
        let session = self.connected_session()?;
        let value = parse_field("disturbance", input)?;
        let command = session.set_disturbance(value)?;
        self.transmit(&command).await;
        Ok(())
    }

    /// Send PID gains; all three must parse
    ///
    /// # Errors
    ///
    /// * `NotConnected` if the link is down
    /// * `Validation` naming the first gain that is not a number
    pub async fn send_pid(&mut self, kp: &str, ki: &str, kd: &str) -> Result<(), DispatchError> {
        let session = self.connected_session()?;
        let gains = PidGains {
            kp: parse_field("kp", kp)?,
            ki: parse_field("ki", ki)?,
            kd: parse_field("kd", kd)?,
        };
        let command = session.set_pid(gains)?;
        self.transmit(&command).await;
        Ok(())
    }

    /// Send `STOP` and close the link
    ///
    /// # Errors
    ///
    /// * `NotConnected` if the link is already down
    pub async fn stop(&mut self) -> Result<(), DispatchError> {
        let command = self.connected_session()?.stop()?;
        self.transmit(&command).await;

        if let Some(link) = self.link.take() {
            link.close();
        }
        if !self.sampler.records().is_empty() {
            info!("{} records ready for export", self.sampler.records().len());
        }
        Ok(())
    }

    /// Send a heartbeat if connected
    pub async fn heartbeat(&mut self) {
        if let Some(command) = self.session.as_ref().and_then(SessionState::heartbeat) {
            self.transmit(&command).await;
        }
    }

    /// Route one reader event
    ///
    /// Events from links other than the open one are dropped.
    pub fn handle_event(&mut self, event: LinkEvent, now: Instant, wall_clock: DateTime<Local>) {
        if self.current_link_id() != Some(event.link_id()) {
            trace!("Dropping event from stale link {}", event.link_id());
            return;
        }

        match event {
            LinkEvent::Line { line, .. } => self.handle_line(&line, now, wall_clock),
            LinkEvent::Closed { reason, .. } => self.handle_link_closed(&reason),
        }
    }

    fn handle_line(&mut self, line: &str, now: Instant, wall_clock: DateTime<Local>) {
        let Some(sample) = decode_telemetry(line) else {
            trace!("Ignoring line: {:?}", line);
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.sampler.ingest(&sample, session, now, wall_clock).is_some() {
            self.series = Arc::from(self.sampler.series());
        }
    }

    fn handle_link_closed(&mut self, reason: &str) {
        warn!("Link lost: {}", reason);
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(session) = self.session.as_mut() {
            session.link_lost();
        }
    }

    /// Detach the log for export
    ///
    /// The path's extension picks the format when none is given, falling
    /// back to the configured default.
    ///
    /// # Errors
    ///
    /// * `ExportUnavailable` while connected or when nothing was logged
    pub fn export_job(
        &self,
        path: PathBuf,
        format: Option<ExportFormat>,
    ) -> Result<ExportJob, DispatchError> {
        if self.link.is_some() {
            return Err(DispatchError::ExportUnavailable("stop the session first"));
        }
        let Some(session) = &self.session else {
            return Err(DispatchError::ExportUnavailable("no session has run"));
        };
        if self.sampler.records().is_empty() {
            return Err(DispatchError::ExportUnavailable("the log is empty"));
        }

        let format = format
            .or_else(|| ExportFormat::from_path(&path))
            .unwrap_or(self.settings.export_format);

        Ok(ExportJob {
            records: self.sampler.records().to_vec(),
            mode: session.mode(),
            path,
            format,
        })
    }

    /// Stop the session if one is running
    pub async fn shutdown(&mut self) {
        if self.link.is_some() {
            if let Err(e) = self.stop().await {
                debug!("Shutdown stop failed: {}", e);
            }
        }
    }

    /// Current read-only view
    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        let column_mode = session.map_or(self.selected_mode, SessionState::mode);

        SessionSnapshot {
            connection: session.map_or(ConnectionStatus::Disconnected, SessionState::connection),
            port: self.link.as_ref().map(|link| link.port_name().to_string()),
            mode: self.selected_mode,
            phase: session.map(SessionState::run_phase),
            monitoring: session.is_some_and(SessionState::monitoring),
            base_heat_confirmed: session.map_or(
                self.selected_mode != OperatingMode::FanOnly,
                SessionState::base_heat_confirmed,
            ),
            base_heat_percent: session.and_then(SessionState::base_heat_percent),
            setpoint: session.and_then(SessionState::setpoint),
            disturbance: session.and_then(SessionState::disturbance),
            current_pid: session.and_then(SessionState::current_pid),
            logging_interval_s: session.map(|s| s.logging_interval().as_secs()),
            locks: session.map(SessionState::locks).unwrap_or_default(),
            live: self.sampler.live(),
            record_count: self.sampler.records().len(),
            last_record: self.sampler.records().last().cloned(),
            series: Arc::clone(&self.series),
            columns: display_columns(column_mode),
            export_available: self.link.is_none() && !self.sampler.records().is_empty(),
        }
    }

    /// Id of the open link
    pub fn current_link_id(&self) -> Option<u64> {
        self.link.as_ref().map(SerialLink::link_id)
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    pub fn sampler(&self) -> &TelemetrySampler {
        &self.sampler
    }

    fn connected_session(&mut self) -> Result<&mut SessionState, DispatchError> {
        match self.session.as_mut() {
            Some(session) if session.is_connected() => Ok(session),
            _ => Err(DispatchError::NotConnected),
        }
    }

    async fn transmit(&mut self, command: &Command) {
        if let Some(link) = self.link.as_mut() {
            link.send(command).await;
        }
    }
}
