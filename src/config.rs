//! Configuration of a write
//!
//! A [WriteRequest] holds what a user entered: offsets as text, image paths,
//! an optional stub path. [WriteRequest::into_config] validates it and reads
//! every file, producing the [SessionConfig] a write runs from. All of this
//! happens before any byte is sent to the device.

use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    connection::ROM_BAUD,
    error::ConfigError,
    flasher::{stubs::FlashStub, FlashFrequency, FlashMode, FlashSettings, FlashSize},
    targets::Chip,
};

/// Whether to compress images before sending them
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompressMode {
    /// Always compress
    On,
    /// Never compress
    Off,
    /// Compress when the flasher stub is running
    #[default]
    Auto,
}

impl CompressMode {
    pub fn resolve(self, stub_running: bool) -> bool {
        match self {
            CompressMode::On => true,
            CompressMode::Off => false,
            CompressMode::Auto => stub_running,
        }
    }
}

/// An image and the flash address it is written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePair {
    pub address: u32,
    /// Name shown to the user, usually the file name
    pub name: String,
    pub data: Vec<u8>,
}

/// Everything a write needs, validated and with all files read
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chip: Chip,
    pub port: String,
    /// Baud rate to switch to after connecting
    pub baud: u32,
    /// Header settings for bootloader images. A `None` size means the size
    /// detected on the device.
    pub flash: FlashSettings,
    pub images: Vec<ImagePair>,
    pub erase_all: bool,
    pub compress: CompressMode,
    /// Compare every digest once more after the write is finalized
    pub verify: bool,
    /// Stub to upload; the ROM loader does the work when absent
    pub stub: Option<FlashStub>,
}

impl SessionConfig {
    pub fn new(port: impl Into<String>, images: Vec<ImagePair>) -> Self {
        SessionConfig {
            chip: Chip::Esp32,
            port: port.into(),
            baud: ROM_BAUD,
            flash: FlashSettings::default(),
            images,
            erase_all: false,
            compress: CompressMode::Auto,
            verify: false,
            stub: None,
        }
    }
}

/// A write as requested by the user
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub chip: Chip,
    pub port: String,
    pub baud: Option<u32>,
    /// Pairs of hexadecimal offset and image path
    pub images: Vec<(String, PathBuf)>,
    pub erase_all: bool,
    pub verify: bool,
    pub compress: CompressMode,
    pub flash_mode: Option<FlashMode>,
    pub flash_freq: Option<FlashFrequency>,
    pub flash_size: Option<FlashSize>,
    pub stub: Option<PathBuf>,
}

impl WriteRequest {
    /// Validate the request and read the files it names
    pub fn into_config(self) -> Result<SessionConfig, ConfigError> {
        if self.images.is_empty() && !self.erase_all {
            return Err(ConfigError::NothingToWrite);
        }

        let images = self
            .images
            .iter()
            .map(|(offset, path)| {
                let address = parse_offset(offset)?;
                let data = fs::read(path).map_err(|source| ConfigError::ImageRead {
                    path: path.clone(),
                    source,
                })?;
                let name = path
                    .file_name()
                    .unwrap_or(path.as_os_str())
                    .to_string_lossy()
                    .into_owned();

                Ok(ImagePair {
                    address,
                    name,
                    data,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let stub = self.stub.as_deref().map(FlashStub::load).transpose()?;

        Ok(SessionConfig {
            chip: self.chip,
            port: self.port,
            baud: self.baud.unwrap_or(ROM_BAUD),
            flash: FlashSettings::new(self.flash_mode, self.flash_size, self.flash_freq),
            images,
            erase_all: self.erase_all,
            compress: self.compress,
            verify: self.verify,
            stub,
        })
    }
}

/// Parse a hexadecimal flash offset, with or without a leading `0x`
pub fn parse_offset(input: &str) -> Result<u32, ConfigError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    // `from_str_radix` would also take a leading sign
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidOffset(input.to_string()));
    }

    u32::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidOffset(input.to_string()))
}
