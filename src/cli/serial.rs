use miette::{miette, IntoDiagnostic, Result};
use serialport::{available_ports, SerialPortInfo, SerialPortType};

use super::{config::Config, ConnectArgs};
use crate::error::{ConnectionError, Error};

/// Name of the serial port to use
///
/// A port given as a command-line argument takes precedence over the one in
/// the configuration file. When neither is given, the only USB serial port
/// present is used.
pub fn get_serial_port(args: &ConnectArgs, config: &Config) -> Result<String> {
    if let Some(serial) = args.port.as_ref().or(config.connection.serial.as_ref()) {
        return Ok(serial.clone());
    }

    let ports = detect_usb_serial_ports()?;

    match ports.as_slice() {
        [] => Err(Error::Connection(ConnectionError::DeviceNotFound).into()),
        [port] => {
            println!("Using serial port {}", port.port_name);
            Ok(port.port_name.clone())
        }
        ports => {
            let names = ports
                .iter()
                .map(|port| port.port_name.as_str())
                .collect::<Vec<_>>()
                .join(", ");

            Err(miette!(
                help = "Select one with `--port` or in flashwriter.toml",
                "More than one serial port found: {names}"
            ))
        }
    }
}

fn detect_usb_serial_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = available_ports().into_diagnostic()?;

    Ok(ports
        .into_iter()
        .filter(|port| matches!(port.port_type, SerialPortType::UsbPort(_)))
        .collect())
}
