//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
    path::PathBuf,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::{connection::command::CommandType, slip::SlipError};

/// All possible errors returned by flashwriter
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Timed out while connecting to the device")]
    #[diagnostic(
        code(flashwriter::connect_timeout),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectTimeout,

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Protocol violation")]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("The device does not support the {command} command")]
    #[diagnostic(code(flashwriter::unsupported_operation))]
    UnsupportedOperation { command: CommandType },

    #[error("This operation requires the flasher stub")]
    #[diagnostic(
        code(flashwriter::stub_required),
        help("Provide a stub program with `--stub` or the `stub` configuration key")
    )]
    StubRequired,

    #[error("Failed to upload and start the flasher stub")]
    #[diagnostic(code(flashwriter::stub_upload))]
    StubUpload(#[source] Box<Error>),

    #[error("Failed to identify the connected device")]
    #[diagnostic(code(flashwriter::identify))]
    Identify(#[source] Box<Error>),

    #[error("Unrecognized magic value: {0:#x}")]
    #[diagnostic(
        code(flashwriter::chip_detect_error),
        help("Only the ESP32 is supported. Try hard-resetting the device and try again")
    )]
    ChipDetectError(u32),

    #[error("File {file} (length {length}) at offset {offset:#x} will not fit in {flash_size} bytes of flash")]
    #[diagnostic(
        code(flashwriter::flash_overflow),
        help("Use the `--flash-size` argument, or change the flashing address")
    )]
    FlashOverflow {
        file: String,
        offset: u32,
        length: usize,
        flash_size: u32,
    },

    #[error("MD5 of file does not match data in flash at {address:#010x}: expected {}, received {}", hex(.expected), hex(.actual))]
    #[diagnostic(code(flashwriter::verify_failed))]
    VerificationFailed {
        address: u32,
        expected: [u8; 16],
        actual: [u8; 16],
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(flashwriter::cancelled))]
    Cancelled,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Connection(err.into())
    }
}

impl Error {
    /// Whether this error is a read timeout on the transport
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::Timeout(_))
                | Error::Flashing(ConnectionError::Timeout(_))
        )
    }

    /// Whether this error means the transport can no longer be used
    pub fn is_port_closed(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::PortClosed)
                | Error::Flashing(ConnectionError::PortClosed)
        )
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(flashwriter::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(flashwriter::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(flashwriter::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    FramingError,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(flashwriter::stub_handshake))]
    InvalidStubHandshake,

    #[error("The serial port was closed")]
    #[diagnostic(
        code(flashwriter::port_closed),
        help("Check the cable, the device may have been unplugged")
    )]
    PortClosed,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(flashwriter::timeout))]
    Timeout(TimedOutCommand),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(flashwriter::serial_error))]
    Serial(#[source] io::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
            ErrorKind::NotFound => ConnectionError::DeviceNotFound,
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::NotConnected => {
                ConnectionError::PortClosed
            }
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<SlipError> for ConnectionError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError(_) | SlipError::Truncated => Self::FramingError,
            SlipError::EndOfStream => Self::PortClosed,
            SlipError::ReadError(io) => Self::from(io),
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Misuse of the serial protocol, detected either locally or in a response
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Expected a response to {expected}, received opcode {got:#04x}")]
    #[diagnostic(code(flashwriter::protocol::unexpected_response))]
    UnexpectedResponse { expected: CommandType, got: u8 },

    #[error("Response too short, expected at least {expected} bytes, got {got}")]
    #[diagnostic(code(flashwriter::protocol::short_response))]
    ShortResponse { expected: usize, got: usize },

    #[error("Malformed {command} response")]
    #[diagnostic(code(flashwriter::protocol::malformed_response))]
    MalformedResponse { command: CommandType },

    #[error("Block sent out of sequence, expected {expected}, got {got}")]
    #[diagnostic(code(flashwriter::protocol::out_of_sequence))]
    OutOfSequence { expected: u32, got: u32 },

    #[error("Invalid session state: {0}")]
    #[diagnostic(code(flashwriter::protocol::invalid_state))]
    InvalidState(&'static str),
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(flashwriter::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(flashwriter::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(flashwriter::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(flashwriter::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(flashwriter::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(flashwriter::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(flashwriter::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(flashwriter::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(flashwriter::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(flashwriter::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(flashwriter::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(flashwriter::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(flashwriter::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(flashwriter::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(flashwriter::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(flashwriter::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(flashwriter::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(flashwriter::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    /// The command which the device rejected
    pub fn command(&self) -> CommandType {
        self.command
    }

    /// The reason given by the device
    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

/// Invalid user input, always detected before any device I/O
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Invalid flash offset '{0}'")]
    #[diagnostic(
        code(flashwriter::config::invalid_offset),
        help("Offsets are hexadecimal, with or without a leading `0x`")
    )]
    InvalidOffset(String),

    #[error("Failed to read image file {}", path.display())]
    #[diagnostic(code(flashwriter::config::image_read))]
    ImageRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Nothing to write: no images were given and erase-all is not set")]
    #[diagnostic(code(flashwriter::config::nothing_to_write))]
    NothingToWrite,

    #[error("Invalid flash size '{0}'")]
    #[diagnostic(
        code(flashwriter::config::invalid_flash_size),
        help("Supported sizes are 1MB, 2MB, 4MB, 8MB and 16MB")
    )]
    InvalidFlashSize(String),

    #[error("The flash size could not be detected")]
    #[diagnostic(
        code(flashwriter::config::unknown_flash_size),
        help("Specify the flash size explicitly with `--flash-size`")
    )]
    UnknownFlashSize,

    #[error("Invalid stub program: {0}")]
    #[diagnostic(code(flashwriter::config::invalid_stub))]
    InvalidStub(String),

    #[error("Failed to read stub program {}", path.display())]
    #[diagnostic(code(flashwriter::config::stub_read))]
    StubRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
