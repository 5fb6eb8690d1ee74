//! # Port Discovery
//!
//! Lists candidate serial ports and picks the plant controller by matching
//! the port descriptor against a set of hints (e.g. `arduino`, `ch340`).

use crate::error::{Result, ThermalBridgeError};

#[cfg(test)]
use mockall::automock;

/// Descriptor substrings that identify the plant controller by default
pub const DEFAULT_PORT_HINTS: &[&str] = &["arduino", "ch340"];

/// A port the user could connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// Identifier passed to `open` (e.g. `/dev/ttyUSB0`, `COM3`)
    pub name: String,

    /// Human readable description (manufacturer and product for USB ports)
    pub descriptor: String,
}

/// Source of candidate ports
#[cfg_attr(test, automock)]
pub trait PortEnumerator {
    /// List ports currently present on the system
    fn available(&self) -> Result<Vec<PortCandidate>>;
}

/// Enumerates ports through the OS
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn available(&self) -> Result<Vec<PortCandidate>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| ThermalBridgeError::Serial(format!("Failed to list ports: {}", e)))?;

        Ok(ports
            .into_iter()
            .map(|port| {
                let descriptor = match port.port_type {
                    tokio_serial::SerialPortType::UsbPort(info) => {
                        let parts: Vec<String> =
                            [info.manufacturer, info.product].into_iter().flatten().collect();
                        if parts.is_empty() {
                            "USB Serial".to_string()
                        } else {
                            parts.join(" ")
                        }
                    }
                    tokio_serial::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    tokio_serial::SerialPortType::PciPort => "PCI".to_string(),
                    tokio_serial::SerialPortType::Unknown => String::new(),
                };
                PortCandidate {
                    name: port.port_name,
                    descriptor,
                }
            })
            .collect())
    }
}

/// Pick the first candidate whose descriptor contains any hint (case-insensitive)
pub fn auto_select<'a, S: AsRef<str>>(
    candidates: &'a [PortCandidate],
    hints: &[S],
) -> Option<&'a PortCandidate> {
    candidates.iter().find(|candidate| {
        let descriptor = candidate.descriptor.to_lowercase();
        hints
            .iter()
            .map(|hint| hint.as_ref().trim().to_lowercase())
            .any(|hint| !hint.is_empty() && descriptor.contains(&hint))
    })
}

/// Resolve the port to open
///
/// An explicitly configured port wins. Otherwise the first hinted match is
/// used, then the first port present.
///
/// # Errors
///
/// Returns `SerialPortNotFound` when nothing is configured and no port exists.
pub fn select_port<E, S>(enumerator: &E, configured: &str, hints: &[S]) -> Result<String>
where
    E: PortEnumerator + ?Sized,
    S: AsRef<str>,
{
    if !configured.trim().is_empty() {
        return Ok(configured.trim().to_string());
    }

    let candidates = enumerator.available()?;
    if let Some(found) = auto_select(&candidates, hints) {
        return Ok(found.name.clone());
    }

    candidates
        .into_iter()
        .next()
        .map(|candidate| candidate.name)
        .ok_or_else(|| ThermalBridgeError::SerialPortNotFound("no serial ports present".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<PortCandidate> {
        vec![
            PortCandidate { name: "/dev/ttyS0".into(), descriptor: String::new() },
            PortCandidate { name: "/dev/ttyUSB0".into(), descriptor: "QinHeng USB-SERIAL CH340".into() },
            PortCandidate { name: "/dev/ttyACM0".into(), descriptor: "Arduino (www.arduino.cc) Uno".into() },
        ]
    }

    #[test]
    fn test_auto_select_first_hint_match() {
        let ports = candidates();
        let found = auto_select(&ports, DEFAULT_PORT_HINTS).unwrap();
        assert_eq!(found.name, "/dev/ttyUSB0");
    }

    #[test]
    fn test_auto_select_case_insensitive() {
        let ports = candidates();
        let found = auto_select(&ports, &["ARDUINO"]).unwrap();
        assert_eq!(found.name, "/dev/ttyACM0");
    }

    #[test]
    fn test_auto_select_ignores_blank_hints() {
        let ports = candidates();
        assert!(auto_select(&ports, &[""]).is_none());
        assert!(auto_select(&ports, &["ftdi"]).is_none());
    }

    #[test]
    fn test_select_port_prefers_configured() {
        let mut enumerator = MockPortEnumerator::new();
        enumerator.expect_available().never();

        let port = select_port(&enumerator, "COM7", DEFAULT_PORT_HINTS).unwrap();
        assert_eq!(port, "COM7");
    }

    #[test]
    fn test_select_port_uses_hint() {
        let mut enumerator = MockPortEnumerator::new();
        enumerator.expect_available().times(1).returning(|| Ok(candidates()));

        let port = select_port(&enumerator, "", &["arduino"]).unwrap();
        assert_eq!(port, "/dev/ttyACM0");
    }

    #[test]
    fn test_select_port_falls_back_to_first() {
        let mut enumerator = MockPortEnumerator::new();
        enumerator.expect_available().times(1).returning(|| Ok(candidates()));

        let port = select_port(&enumerator, " ", &["ftdi"]).unwrap();
        assert_eq!(port, "/dev/ttyS0");
    }

    #[test]
    fn test_select_port_no_ports() {
        let mut enumerator = MockPortEnumerator::new();
        enumerator.expect_available().times(1).returning(|| Ok(Vec::new()));

        match select_port(&enumerator, "", DEFAULT_PORT_HINTS) {
            Err(ThermalBridgeError::SerialPortNotFound(_)) => {}
            other => panic!("Expected SerialPortNotFound, got: {:?}", other),
        }
    }
}
