//! # Session State Module
//!
//! The operating-mode and safety-interlock state machine for one connection.
//!
//! ```text
//!            connect                submit_setpoint          2 s elapsed
//! (none) ───────────▶ Idle ───────────────────────▶ Stabilizing ─────────▶ Running
//!                      │  ▲ change_mode                  │                     │
//!                      │  └──────┘                       │ stop / link lost    │
//!                      └─────────────────────────────────┴─────────────────────┴──▶ Stopped
//! ```
//!
//! Every transition that talks to the plant returns the [`Command`]s to
//! transmit, in order. The caller owns the transport; this type never does
//! I/O.
//!
//! Monitoring (whether frames are logged) is switched on at connect, not at
//! the end of stabilization, and re-asserted when stabilization ends. Frames
//! are therefore logged before a setpoint exists and during the grace period.

pub mod types;

use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::wire::encoder::format_number;
use crate::wire::protocol::{Command, OperatingMode, PidGains, PWM_MAX};
pub use types::*;

/// Lowest accepted base heat, in percent of full lamp drive
pub const BASE_HEAT_MIN_PERCENT: f64 = 10.0;

/// Highest accepted base heat, in percent of full lamp drive
pub const BASE_HEAT_MAX_PERCENT: f64 = 100.0;

/// Temperatures at or below this are sensor glitches and never logged
pub const MIN_LOGGABLE_TEMPERATURE: f64 = 0.1;

/// Marker attached to records that carry no event
pub const NO_EVENT_MARKER: &str = "-";

/// Timing data handed to the sampler when a record is admitted
#[derive(Debug, Clone, PartialEq)]
pub struct RecordStamp {
    /// Time since the session started
    pub elapsed: Duration,

    /// Event marker to attach (`"-"` when none was pending)
    pub event: String,
}

/// State of one connection
#[derive(Debug, Clone)]
pub struct SessionState {
    connection: ConnectionStatus,
    mode: OperatingMode,
    monitoring: bool,
    base_heat_confirmed: bool,
    base_heat_percent: Option<f64>,
    run_phase: RunPhase,
    started_at: Instant,
    logging_interval: LoggingInterval,
    last_log_at: Option<Instant>,
    pending_event: Option<String>,
    setpoint: Option<f64>,
    disturbance: Option<f64>,
    current_pid: Option<PidGains>,
    locks: InputLocks,
    run_id: u64,
}

impl SessionState {
    /// Start a session on a freshly opened link
    ///
    /// Monitoring starts immediately. The mode carries over from the
    /// operator's last selection; the base heat is unconfirmed when that mode
    /// is fan-only.
    pub fn connect(mode: OperatingMode, logging_interval: LoggingInterval, now: Instant) -> Self {
        info!(
            "Session started (mode: {}, logging every {}s)",
            mode,
            logging_interval.as_secs()
        );
        Self {
            connection: ConnectionStatus::Connected,
            mode,
            monitoring: true,
            base_heat_confirmed: mode != OperatingMode::FanOnly,
            base_heat_percent: None,
            run_phase: RunPhase::Idle,
            started_at: now,
            logging_interval,
            last_log_at: None,
            pending_event: None,
            setpoint: None,
            disturbance: None,
            current_pid: None,
            locks: InputLocks {
                logging_interval: true,
                ..InputLocks::default()
            },
            run_id: 0,
        }
    }

    /// Switch the operating mode
    ///
    /// # Errors
    ///
    /// * `NotConnected` if the link is down
    /// * `RunActive` unless the session is idle
    pub fn change_mode(&mut self, mode: OperatingMode) -> Result<Command, SessionError> {
        self.require_connected()?;
        if self.run_phase != RunPhase::Idle {
            return Err(SessionError::RunActive(self.run_phase));
        }

        self.mode = mode;
        if mode == OperatingMode::FanOnly {
            // The operator must confirm the base heat again for every fan-only selection
            self.base_heat_confirmed = false;
            self.locks.base_heat = false;
        } else {
            self.base_heat_confirmed = true;
        }

        info!("Mode changed to {}", mode);
        Ok(Command::SetMode(mode))
    }

    /// Confirm the base heat for fan-only runs
    ///
    /// The percentage is clamped to 10-100 and converted to a rounded PWM
    /// duty. The base heat input is locked afterwards.
    ///
    /// # Errors
    ///
    /// * `NotConnected` if the link is down
    /// * `InputLocked` if the base heat was already confirmed or a run is active
    pub fn confirm_base_heat(&mut self, percent: f64) -> Result<Command, SessionError> {
        self.require_connected()?;
        if self.locks.base_heat {
            return Err(SessionError::InputLocked("base heat"));
        }

        let percent = percent.clamp(BASE_HEAT_MIN_PERCENT, BASE_HEAT_MAX_PERCENT);
        let pwm = base_heat_pwm(percent);

        self.base_heat_percent = Some(percent);
        self.base_heat_confirmed = true;
        self.locks.base_heat = true;

        info!("Base heat confirmed at {}% (PWM {})", percent, pwm);
        Ok(Command::SetBasePwm(pwm))
    }

    /// Start a setpoint run
    ///
    /// Returns the mode (re-sent so the firmware is certainly in the right
    /// mode) and setpoint commands, plus the ticket for the stabilization
    /// timer the caller must schedule.
    ///
    /// # Errors
    ///
    /// * `NotConnected` if the link is down
    /// * `InputLocked` if a run is already active
    /// * `BaseHeatUnconfirmed` in fan-only mode without a confirmed base heat
    pub fn begin_run(
        &mut self,
        setpoint: f64,
    ) -> Result<([Command; 2], StabilizationTicket), SessionError> {
        self.require_connected()?;
        if self.locks.setpoint {
            return Err(SessionError::InputLocked("setpoint"));
        }
        if self.mode == OperatingMode::FanOnly && !self.base_heat_confirmed {
            return Err(SessionError::BaseHeatUnconfirmed);
        }

        self.locks.mode = true;
        self.locks.setpoint = true;
        self.locks.base_heat = true;
        self.setpoint = Some(setpoint);
        self.pending_event = Some(format!("INICIO (Set: {})", format_number(setpoint)));
        self.run_phase = RunPhase::Stabilizing;
        self.run_id += 1;

        info!("Run {} started at setpoint {}°C, stabilizing", self.run_id, setpoint);
        Ok((
            [Command::SetMode(self.mode), Command::SetSetpoint(setpoint)],
            StabilizationTicket { run_id: self.run_id },
        ))
    }

    /// End the stabilization grace period
    ///
    /// Returns `false` (and changes nothing) when the ticket belongs to an
    /// earlier run or the run was stopped in the meantime.
    pub fn finish_stabilization(&mut self, ticket: StabilizationTicket) -> bool {
        if ticket.run_id != self.run_id
            || self.run_phase != RunPhase::Stabilizing
            || self.connection != ConnectionStatus::Connected
        {
            debug!("Ignoring stale stabilization timer for run {}", ticket.run_id);
            return false;
        }

        self.run_phase = RunPhase::Running;
        self.monitoring = true;
        info!("Run {} stabilized, running", self.run_id);
        true
    }

    /// Stop everything
    ///
    /// Returns the `STOP` command; the caller sends it and then closes the link.
    ///
    /// # Errors
    ///
    /// * `NotConnected` if the link is already down
    pub fn stop(&mut self) -> Result<Command, SessionError> {
        self.require_connected()?;
        self.shut_down();
        info!("Session stopped");
        Ok(Command::Stop)
    }

    /// The link failed underneath the session
    pub fn link_lost(&mut self) {
        if self.connection == ConnectionStatus::Connected {
            self.shut_down();
            info!("Session ended: link lost");
        }
    }

    /// Record a disturbance value to transmit
    pub fn set_disturbance(&mut self, value: f64) -> Result<Command, SessionError> {
        self.require_connected()?;
        self.disturbance = Some(value);
        Ok(Command::SetDisturbance(value))
    }

    /// Record PID gains to transmit; they become the current PID readout
    pub fn set_pid(&mut self, gains: PidGains) -> Result<Command, SessionError> {
        self.require_connected()?;
        self.current_pid = Some(gains);
        Ok(Command::SetPid(gains))
    }

    /// Heartbeat command, only while connected
    pub fn heartbeat(&self) -> Option<Command> {
        (self.connection == ConnectionStatus::Connected).then_some(Command::Heartbeat)
    }

    /// Apply the logging filter to a frame received at `now`
    ///
    /// A record is admitted only while monitoring, for temperatures above
    /// [`MIN_LOGGABLE_TEMPERATURE`], and when at least one logging interval
    /// has passed since the previous record. Admission consumes the pending
    /// event marker.
    pub fn admit_record(&mut self, temperature: f64, now: Instant) -> Option<RecordStamp> {
        if !self.monitoring || temperature.is_nan() || temperature <= MIN_LOGGABLE_TEMPERATURE {
            return None;
        }

        if let Some(last) = self.last_log_at {
            if now.saturating_duration_since(last) < self.logging_interval.as_duration() {
                return None;
            }
        }

        self.last_log_at = Some(now);
        Some(RecordStamp {
            elapsed: now.saturating_duration_since(self.started_at),
            event: self
                .pending_event
                .take()
                .unwrap_or_else(|| NO_EVENT_MARKER.to_string()),
        })
    }

    fn shut_down(&mut self) {
        self.monitoring = false;
        self.connection = ConnectionStatus::Disconnected;
        self.run_phase = RunPhase::Stopped;
        self.locks = InputLocks::default();
    }

    fn require_connected(&self) -> Result<(), SessionError> {
        match self.connection {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Disconnected => Err(SessionError::NotConnected),
        }
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionStatus::Connected
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn monitoring(&self) -> bool {
        self.monitoring
    }

    pub fn base_heat_confirmed(&self) -> bool {
        self.base_heat_confirmed
    }

    pub fn base_heat_percent(&self) -> Option<f64> {
        self.base_heat_percent
    }

    pub fn run_phase(&self) -> RunPhase {
        self.run_phase
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn logging_interval(&self) -> LoggingInterval {
        self.logging_interval
    }

    pub fn pending_event(&self) -> Option<&str> {
        self.pending_event.as_deref()
    }

    pub fn setpoint(&self) -> Option<f64> {
        self.setpoint
    }

    pub fn disturbance(&self) -> Option<f64> {
        self.disturbance
    }

    pub fn current_pid(&self) -> Option<PidGains> {
        self.current_pid
    }

    pub fn locks(&self) -> InputLocks {
        self.locks
    }
}

/// PWM duty for a base heat percentage (rounded)
pub fn base_heat_pwm(percent: f64) -> u8 {
    (percent / 100.0 * PWM_MAX).round().clamp(0.0, PWM_MAX) as u8
}
