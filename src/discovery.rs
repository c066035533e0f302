//! Serial port auto-discovery.
//!
//! The SMCI33-1 stepper driver enumerates as a USB serial device carrying the
//! manufacturer descriptor of its vendor. Discovery scans the available ports
//! for that descriptor instead of probing with wire traffic, so it is safe to
//! run while other instruments share the machine.

use log::debug;
use serialport::SerialPortType;

use crate::error::{StageError, StageResult};

/// USB manufacturer descriptor of the stepper driver.
pub const DRIVER_MANUFACTURER: &str = "Nanotec";

/// Locate the serial port the stepper driver is connected to.
///
/// Fails with [`StageError::DeviceNotFound`] unless exactly one port carries
/// the vendor descriptor; with several candidates the port must be set
/// explicitly in the configuration rather than guessed.
pub fn find_port() -> StageResult<String> {
    let ports = serialport::available_ports()?;
    debug!("discovery: scanning {} serial ports", ports.len());
    select_port(ports.into_iter().map(|port| {
        let manufacturer = match port.port_type {
            SerialPortType::UsbPort(usb) => usb.manufacturer,
            _ => None,
        };
        (port.port_name, manufacturer)
    }))
}

fn select_port(
    candidates: impl Iterator<Item = (String, Option<String>)>,
) -> StageResult<String> {
    let mut matches: Vec<String> = candidates
        .filter(|(_, manufacturer)| manufacturer.as_deref() == Some(DRIVER_MANUFACTURER))
        .map(|(name, _)| name)
        .collect();

    match matches.len() {
        0 => Err(StageError::DeviceNotFound(format!(
            "no {DRIVER_MANUFACTURER} device on any serial port"
        ))),
        1 => {
            let name = matches.remove(0);
            debug!("discovery: found stepper driver on '{name}'");
            Ok(name)
        }
        n => Err(StageError::DeviceNotFound(format!(
            "{n} {DRIVER_MANUFACTURER} devices found ({}); set the port explicitly",
            matches.join(", ")
        ))),
    }
}
