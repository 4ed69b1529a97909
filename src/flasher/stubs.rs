//! Stub loader module.

use std::{fs, path::Path};

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use crate::error::ConfigError;

pub(crate) const EXPECTED_STUB_HANDSHAKE: &str = "OHAI";

/// Flash stub file contents, as converted from the JSON used by `esptool.py`
#[derive(Debug, Deserialize)]
struct StubFile {
    /// Entry point (address)
    entry: u32,
    /// Text (base64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data (base64 encoded)
    #[serde(default)]
    data: String,
    /// Start of data section address
    #[serde(default)]
    data_start: u32,
}

/// Flash stub object, a program uploaded to RAM which takes over from the ROM
/// loader and answers the same protocol faster and with more commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashStub {
    entry: u32,
    text_start: u32,
    text: Vec<u8>,
    data_start: u32,
    data: Vec<u8>,
}

impl FlashStub {
    pub fn new(entry: u32, text: (u32, Vec<u8>), data: (u32, Vec<u8>)) -> Self {
        FlashStub {
            entry,
            text_start: text.0,
            text: text.1,
            data_start: data.0,
            data: data.1,
        }
    }

    /// Parse a stub from its TOML description
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let file: StubFile =
            toml::from_str(s).map_err(|e| ConfigError::InvalidStub(e.message().to_string()))?;

        let decode = |section: &str, encoded: &str| {
            general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| ConfigError::InvalidStub(format!("{section}: {e}")))
        };

        Ok(FlashStub {
            entry: file.entry,
            text_start: file.text_start,
            text: decode("text", &file.text)?,
            data_start: file.data_start,
            data: decode("data", &file.data)?,
        })
    }

    /// Read and parse a stub TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::StubRead {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml(&contents)
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and bytes
    pub fn text(&self) -> (u32, &[u8]) {
        (self.text_start, &self.text)
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> (u32, &[u8]) {
        (self.data_start, &self.data)
    }
}
