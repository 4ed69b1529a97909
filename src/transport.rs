//! Byte-stream transports used to talk to a target device
//!
//! The [Transport] trait is the boundary between the protocol engine and the
//! operating system. The engine only ever needs to open the link at a given
//! baud rate, exchange bytes with a read timeout and toggle the DTR/RTS modem
//! lines, which are wired to the chip's `EN` and `IO0` pins on most boards.

use std::{io, time::Duration};

/// A duplex byte stream connected to a target device
pub trait Transport: Send {
    /// Human readable name of the underlying port
    fn name(&self) -> String;

    /// Open the transport, or reconfigure it if it is already open, at the
    /// given baud rate
    fn open(&mut self, baud: u32) -> io::Result<()>;

    /// Close the transport; further I/O fails until it is opened again
    fn close(&mut self);

    /// Whether the transport is currently open
    fn is_open(&self) -> bool;

    /// The baud rate the transport was last opened with
    fn baud(&self) -> u32;

    /// Read at most `buf.len()` bytes, waiting up to `timeout` for the first
    /// one
    ///
    /// Returns an error of kind [io::ErrorKind::TimedOut] when nothing arrived
    /// in time. A return value of `Ok(0)` means the stream was closed.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write all bytes to the device
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush any buffered output
    fn flush(&mut self) -> io::Result<()>;

    /// Discard any bytes received but not yet read
    fn clear_input(&mut self) -> io::Result<()>;

    /// Number of bytes received but not yet read
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Set the level of the DTR line
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    /// Set the level of the RTS line
    fn set_rts(&mut self, level: bool) -> io::Result<()>;
}

#[cfg(feature = "serialport")]
pub use self::serial::SerialTransport;

#[cfg(feature = "serialport")]
mod serial {
    use std::{
        io::{self, Read, Write},
        time::Duration,
    };

    use log::debug;
    use serialport::{ClearBuffer, FlowControl, SerialPort};

    use super::Transport;

    /// A [Transport] backed by an operating system serial port
    pub struct SerialTransport {
        port_name: String,
        baud: u32,
        port: Option<Box<dyn SerialPort>>,
    }

    impl SerialTransport {
        pub fn new(port_name: impl Into<String>) -> Self {
            SerialTransport {
                port_name: port_name.into(),
                baud: 0,
                port: None,
            }
        }

        fn port_mut(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
            self.port.as_mut().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "serial port is not open")
            })
        }
    }

    impl Transport for SerialTransport {
        fn name(&self) -> String {
            self.port_name.clone()
        }

        fn open(&mut self, baud: u32) -> io::Result<()> {
            if let Some(port) = self.port.as_mut() {
                debug!("Reconfiguring {} to {} baud", self.port_name, baud);
                port.set_baud_rate(baud)?;
            } else {
                debug!("Opening {} at {} baud", self.port_name, baud);
                let port = serialport::new(&self.port_name, baud)
                    .flow_control(FlowControl::None)
                    .timeout(Duration::from_secs(3))
                    .open()?;
                self.port = Some(port);
            }
            self.baud = baud;

            Ok(())
        }

        fn close(&mut self) {
            if self.port.take().is_some() {
                debug!("Closed {}", self.port_name);
            }
        }

        fn is_open(&self) -> bool {
            self.port.is_some()
        }

        fn baud(&self) -> u32 {
            self.baud
        }

        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            let port = self.port_mut()?;
            port.set_timeout(timeout)?;
            port.read(buf)
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            Write::write_all(self.port_mut()?, data)
        }

        fn flush(&mut self) -> io::Result<()> {
            Write::flush(self.port_mut()?)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.port_mut()?.clear(ClearBuffer::Input)?;
            Ok(())
        }

        fn bytes_to_read(&mut self) -> io::Result<usize> {
            Ok(self.port_mut()?.bytes_to_read()? as usize)
        }

        fn set_dtr(&mut self, level: bool) -> io::Result<()> {
            self.port_mut()?.write_data_terminal_ready(level)?;
            Ok(())
        }

        fn set_rts(&mut self, level: bool) -> io::Result<()> {
            self.port_mut()?.write_request_to_send(level)?;
            Ok(())
        }
    }
}
