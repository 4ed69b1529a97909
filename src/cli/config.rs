//! Command-line interface configuration
//!
//! Defaults for the command-line arguments can be kept in a `flashwriter.toml`
//! file, looked up in the current directory first and in the user's
//! configuration directory second:
//!
//! ```toml
//! stub = "stubs/esp32.toml"
//!
//! [connection]
//! serial = "/dev/ttyUSB0"
//! baud = 921600
//!
//! [flash]
//! mode = "dio"
//! size = "4MB"
//! frequency = "40MHz"
//! ```
//!
//! Arguments given on the command line always take precedence.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::flasher::FlashSettings;

const CONFIG_FILE_NAME: &str = "flashwriter.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    /// Baud rate to write at
    pub baud: Option<u32>,
}

/// Deserialized contents of a configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path to the flasher stub program
    #[serde(default)]
    pub stub: Option<PathBuf>,
    /// Preferred serial port connection information
    #[serde(default)]
    pub connection: Connection,
    /// Flash settings
    #[serde(default)]
    pub flash: FlashSettings,
}

impl Config {
    /// Load the configuration file, if there is one
    pub fn load() -> Result<Self> {
        match Self::config_path()? {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No {CONFIG_FILE_NAME} found, using defaults");
                Ok(Config::default())
            }
        }
    }

    /// Load the configuration from a specific file
    ///
    /// A relative stub path is taken relative to the directory of the file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;

        let mut config = Self::parse(&data)
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;

        if let (Some(stub), Some(dir)) = (&config.stub, path.parent()) {
            if stub.is_relative() {
                config.stub = Some(dir.join(stub));
            }
        }

        debug!("Config from {}: {:#?}", path.display(), config);

        Ok(config)
    }

    fn parse(data: &str) -> Result<Self> {
        toml::from_str(data).into_diagnostic()
    }

    fn config_path() -> Result<Option<PathBuf>> {
        let local_config = std::env::current_dir()
            .into_diagnostic()?
            .join(CONFIG_FILE_NAME);
        if local_config.exists() {
            return Ok(Some(local_config));
        }

        let global_config = ProjectDirs::from("rs", "flashwriter", "flashwriter")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists());

        Ok(global_config)
    }
}
