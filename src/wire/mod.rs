//! # Wire Protocol Module
//!
//! Implementation of the newline-delimited ASCII protocol spoken by the plant
//! microcontroller.
//!
//! This module handles:
//! - Command encoding (`MODE`, `DIST`, `BASE`, `SET`, `PID`, `STOP`, `PING`)
//! - Telemetry frame decoding (`DADOS,...`)
//! - Parsing command lines back into [`protocol::Command`] values for fixtures

pub mod protocol;
pub mod encoder;
pub mod decoder;
