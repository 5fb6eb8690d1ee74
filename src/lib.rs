//! # Thermal Bridge Library
//!
//! Host-side session manager for a lamp-heated, fan-cooled thermal plant
//! whose microcontroller talks a line-based text protocol over serial.
//!
//! This library provides the serial link, the wire codec, the operating-mode
//! and safety-interlock state machine, telemetry logging and export, and the
//! runtime task that ties them together.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod runtime;
pub mod serial;
pub mod session;
pub mod telemetry;
pub mod wire;
