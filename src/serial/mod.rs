//! # Serial Communication Module
//!
//! Handles the serial link to the plant microcontroller.
//!
//! This module handles:
//! - Opening the serial port at 115,200 baud (8N1, no flow control)
//! - A background reader task that emits one event per received line
//! - Fire-and-forget command writes
//! - Port discovery and auto-selection
//!
//! Reconnection is deliberately absent here; the session decides when to
//! open a new link.

pub mod discovery;
pub mod port_trait;
pub mod reader;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::{Result, ThermalBridgeError};
use crate::wire::encoder::encode_command;
use crate::wire::protocol::Command;
use port_trait::{SerialPortIO, SerialStreamIO, StreamWriter};

/// Baud rate of the plant controller firmware
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Event emitted by a link's reader task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete, trimmed, non-empty line
    Line { link_id: u64, line: String },

    /// The link hit EOF or a read error
    Closed { link_id: u64, reason: String },
}

impl LinkEvent {
    /// Id of the link that produced this event
    pub fn link_id(&self) -> u64 {
        match self {
            LinkEvent::Line { link_id, .. } | LinkEvent::Closed { link_id, .. } => *link_id,
        }
    }
}

/// Opens byte streams for a port identifier
pub trait PortOpener: Send {
    /// Open `port` at `baud_rate`
    ///
    /// # Errors
    ///
    /// Returns `PortUnavailable` if the port cannot be opened.
    fn open(&mut self, port: &str, baud_rate: u32) -> Result<Box<dyn SerialStreamIO>>;
}

/// Opens real serial ports through `tokio-serial`
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePortOpener;

impl PortOpener for NativePortOpener {
    fn open(&mut self, port: &str, baud_rate: u32) -> Result<Box<dyn SerialStreamIO>> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ThermalBridgeError::PortUnavailable {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(stream))
    }
}

/// An open link to the plant controller
///
/// Owns the write half directly; the read half lives in a spawned reader
/// task. Dropping or closing the link stops the reader.
pub struct SerialLink {
    link_id: u64,
    port_name: String,
    writer: Box<dyn SerialPortIO>,
    open: watch::Sender<bool>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("link_id", &self.link_id)
            .field("port_name", &self.port_name)
            .finish_non_exhaustive()
    }
}

impl SerialLink {
    /// Build a link over a bidirectional stream and start its reader
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(
        stream: S,
        port_name: &str,
        link_id: u64,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self
    where
        S: SerialStreamIO,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(read_half, Box::new(StreamWriter::new(write_half)), port_name, link_id, events)
    }

    /// Build a link from an independent reader and writer
    pub fn from_parts<R>(
        read_half: R,
        writer: Box<dyn SerialPortIO>,
        port_name: &str,
        link_id: u64,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (open, open_rx) = watch::channel(true);
        tokio::spawn(reader::read_lines(read_half, link_id, open_rx, events));

        info!("Link {} opened on {}", link_id, port_name);
        Self {
            link_id,
            port_name: port_name.to_string(),
            writer,
            open,
        }
    }

    /// Send a command, ignoring transport failures
    ///
    /// Writes are best-effort: a failure is logged at debug level and the
    /// command is dropped. There is no retry and no queue.
    pub async fn send(&mut self, command: &Command) {
        let line = encode_command(command);

        if let Err(e) = self.writer.write_all(line.as_bytes()).await {
            debug!("Failed to write {:?} on link {}: {}", line.trim_end(), self.link_id, e);
            return;
        }
        if let Err(e) = self.writer.flush().await {
            debug!("Failed to flush link {}: {}", self.link_id, e);
            return;
        }

        debug!("tx: {}", line.trim_end());
    }

    /// Close the link
    ///
    /// Signals the reader to stop; anything it had buffered is discarded.
    pub fn close(self) {
        let _ = self.open.send(false);
        info!("Link {} on {} closed", self.link_id, self.port_name);
    }

    /// Id stamped on this link's events
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Port the link was opened on
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[cfg(test)]
mod tests {
    use super::port_trait::mocks::MockSerialPort;
    use super::*;
    use crate::wire::protocol::OperatingMode;
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BAUD_RATE, 115_200);
    }

    #[test]
    fn test_open_invalid_port_returns_unavailable() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.enter();

        let result = NativePortOpener.open("/dev/nonexistent_serial_device_12345", DEFAULT_BAUD_RATE);

        match result {
            Err(ThermalBridgeError::PortUnavailable { port, .. }) => {
                assert_eq!(port, "/dev/nonexistent_serial_device_12345");
            }
            Err(other) => panic!("Expected PortUnavailable, got: {:?}", other),
            Ok(_) => panic!("Expected PortUnavailable, got an open port"),
        }
    }

    #[tokio::test]
    async fn test_send_writes_encoded_lines() {
        let port = MockSerialPort::new();
        let (events, _rx) = mpsc::channel(4);
        let idle = tokio_test::io::Builder::new().wait(Duration::from_secs(3600)).build();
        let mut link = SerialLink::from_parts(idle, Box::new(port.clone()), "mock", 1, events);

        link.send(&Command::SetMode(OperatingMode::Auto)).await;
        link.send(&Command::SetSetpoint(30.0)).await;

        assert_eq!(port.written_lines(), vec!["MODE:0\n", "SET:30.0\n"]);
        link.close();
    }

    #[tokio::test]
    async fn test_send_swallows_write_errors() {
        let port = MockSerialPort::new();
        port.set_write_error(io::ErrorKind::BrokenPipe);
        let (events, _rx) = mpsc::channel(4);
        let idle = tokio_test::io::Builder::new().wait(Duration::from_secs(3600)).build();
        let mut link = SerialLink::from_parts(idle, Box::new(port.clone()), "mock", 1, events);

        // Must not panic or surface an error
        link.send(&Command::Heartbeat).await;
        assert!(port.get_written_data().is_empty());
        link.close();
    }

    #[tokio::test]
    async fn test_send_swallows_flush_errors() {
        let port = MockSerialPort::new();
        port.set_flush_error(io::ErrorKind::TimedOut);
        let (events, _rx) = mpsc::channel(4);
        let idle = tokio_test::io::Builder::new().wait(Duration::from_secs(3600)).build();
        let mut link = SerialLink::from_parts(idle, Box::new(port.clone()), "mock", 1, events);

        link.send(&Command::Stop).await;
        link.send(&Command::Heartbeat).await;
        assert_eq!(port.written_lines(), vec!["STOP\n", "PING\n"]);
        link.close();
    }

    #[tokio::test]
    async fn test_stream_link_round_trip() {
        let (host, mut device) = tokio::io::duplex(256);
        let (events, mut rx) = mpsc::channel(4);
        let mut link = SerialLink::from_stream(host, "duplex", 9, events);

        device.write_all(b"DADOS,25.0,0,0,0,0,0\n").await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Line { link_id: 9, line: "DADOS,25.0,0,0,0,0,0".into() })
        );

        link.send(&Command::Stop).await;
        let mut buf = [0u8; 5];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"STOP\n");

        assert_eq!(link.link_id(), 9);
        assert_eq!(link.port_name(), "duplex");
        link.close();
    }

    #[tokio::test]
    async fn test_device_hangup_reports_closed() {
        let (host, device) = tokio::io::duplex(64);
        let (events, mut rx) = mpsc::channel(4);
        let link = SerialLink::from_stream(host, "duplex", 2, events);

        drop(device);

        match rx.recv().await {
            Some(LinkEvent::Closed { link_id, .. }) => assert_eq!(link_id, 2),
            other => panic!("Expected Closed, got: {:?}", other),
        }
        assert_eq!(LinkEvent::Closed { link_id: 2, reason: String::new() }.link_id(), 2);
        link.close();
    }

    // Integration test - only runs if the plant controller is connected
    #[tokio::test]
    #[ignore] // Run with: cargo test -- --ignored
    async fn test_open_with_real_hardware() {
        use super::discovery::{select_port, SystemPorts, DEFAULT_PORT_HINTS};

        let Ok(port) = select_port(&SystemPorts, "", DEFAULT_PORT_HINTS) else {
            println!("No serial hardware detected (skipping)");
            return;
        };

        let (events, _rx) = mpsc::channel(16);
        match NativePortOpener.open(&port, DEFAULT_BAUD_RATE) {
            Ok(stream) => {
                let mut link = SerialLink::from_stream(stream, &port, 1, events);
                link.send(&Command::Heartbeat).await;
                link.close();
            }
            Err(e) => println!("Could not open {}: {}", port, e),
        }
    }
}
