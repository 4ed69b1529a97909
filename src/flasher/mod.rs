//! Write binary images to a target device
//!
//! The [Flasher] struct drives an established [Connection] through writing a
//! list of images to flash: bounds checking, optional chip erase, streaming
//! every image in blocks, verifying digests and finalizing the write. It also
//! holds the types describing the attached flash.

use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, VariantNames};

use crate::{
    config::ImagePair,
    connection::{Connection, Personality},
    error::{ConfigError, Error, ResultExt},
    events::{Event, EventSink, VerifyStage},
    image_format::{pad, patch_flash_params, Segment},
    targets::{Chip, Esp32Target, FlashTarget, TransferState},
};

pub mod stubs;

pub(crate) const FLASH_SECTOR_SIZE: usize = 0x1000;
pub(crate) const FLASH_WRITE_SIZE: usize = 0x400;
pub(crate) const STUB_FLASH_WRITE_SIZE: usize = 0x4000;

/// Supported flash frequencies
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
pub enum FlashFrequency {
    /// 20 MHz
    #[serde(rename = "20MHz")]
    #[strum(serialize = "20MHz")]
    #[cfg_attr(feature = "cli", value(name = "20mhz"))]
    _20Mhz,
    /// 26 MHz
    #[serde(rename = "26MHz")]
    #[strum(serialize = "26MHz")]
    #[cfg_attr(feature = "cli", value(name = "26mhz"))]
    _26Mhz,
    /// 40 MHz
    #[serde(rename = "40MHz")]
    #[strum(serialize = "40MHz")]
    #[cfg_attr(feature = "cli", value(name = "40mhz"))]
    #[default]
    _40Mhz,
    /// 80 MHz
    #[serde(rename = "80MHz")]
    #[strum(serialize = "80MHz")]
    #[cfg_attr(feature = "cli", value(name = "80mhz"))]
    _80Mhz,
}

impl FlashFrequency {
    /// Encodes flash frequency into the format used by the bootloader.
    pub fn encode_flash_frequency(self) -> u8 {
        match self {
            FlashFrequency::_20Mhz => 0x2,
            FlashFrequency::_26Mhz => 0x1,
            FlashFrequency::_40Mhz => 0x0,
            FlashFrequency::_80Mhz => 0xf,
        }
    }
}

/// Supported flash modes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio,
    /// Quad Output (4 pins used for data)
    Qout,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio,
    /// Dual Output (2 pins used for data)
    Dout,
}

/// Supported flash sizes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FlashSize {
    /// 1 MB
    #[serde(rename = "1MB")]
    #[cfg_attr(feature = "cli", value(name = "1mb"))]
    _1Mb,
    /// 2 MB
    #[serde(rename = "2MB")]
    #[cfg_attr(feature = "cli", value(name = "2mb"))]
    _2Mb,
    /// 4 MB
    #[serde(rename = "4MB")]
    #[cfg_attr(feature = "cli", value(name = "4mb"))]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    #[cfg_attr(feature = "cli", value(name = "8mb"))]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    #[cfg_attr(feature = "cli", value(name = "16mb"))]
    _16Mb,
    /// The size id read from the flash chip was not recognized
    #[serde(skip)]
    #[cfg_attr(feature = "cli", value(skip))]
    Unknown,
}

impl FlashSize {
    /// Encodes flash size into the upper nibble of the bootloader header's
    /// flash config byte
    ///
    /// ## Values:
    ///
    /// * <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/firmware-image-format.html#file-header>
    pub const fn encode_flash_size(self) -> Option<u8> {
        match self {
            FlashSize::_1Mb => Some(0x00),
            FlashSize::_2Mb => Some(0x10),
            FlashSize::_4Mb => Some(0x20),
            FlashSize::_8Mb => Some(0x30),
            FlashSize::_16Mb => Some(0x40),
            FlashSize::Unknown => None,
        }
    }

    /// Create a [FlashSize] from the size id reported by the flash chip
    ///
    /// [source](https://github.com/espressif/esptool/blob/f4d2510/esptool/cmds.py#L42)
    pub const fn from_detected(value: u8) -> FlashSize {
        match value {
            0x14 | 0x34 => FlashSize::_1Mb,
            0x15 | 0x35 => FlashSize::_2Mb,
            0x16 | 0x36 => FlashSize::_4Mb,
            0x17 | 0x37 => FlashSize::_8Mb,
            0x18 | 0x38 => FlashSize::_16Mb,
            _ => FlashSize::Unknown,
        }
    }

    /// Returns the flash size in bytes, if known
    pub const fn bytes(self) -> Option<u32> {
        match self {
            FlashSize::_1Mb => Some(0x0100000),
            FlashSize::_2Mb => Some(0x0200000),
            FlashSize::_4Mb => Some(0x0400000),
            FlashSize::_8Mb => Some(0x0800000),
            FlashSize::_16Mb => Some(0x1000000),
            FlashSize::Unknown => None,
        }
    }
}

impl FromStr for FlashSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "1MB" => Ok(FlashSize::_1Mb),
            "2MB" => Ok(FlashSize::_2Mb),
            "4MB" => Ok(FlashSize::_4Mb),
            "8MB" => Ok(FlashSize::_8Mb),
            "16MB" => Ok(FlashSize::_16Mb),
            _ => Err(ConfigError::InvalidFlashSize(s.to_string())),
        }
    }
}

/// Flash settings to write into a bootloader image; `None` keeps the value
/// already in the image
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FlashSettings {
    pub mode: Option<FlashMode>,
    pub size: Option<FlashSize>,
    #[serde(rename = "frequency")]
    pub freq: Option<FlashFrequency>,
}

impl FlashSettings {
    pub fn new(
        mode: Option<FlashMode>,
        size: Option<FlashSize>,
        freq: Option<FlashFrequency>,
    ) -> Self {
        FlashSettings { mode, size, freq }
    }
}

/// Parameters of the attached SPI flash chip (sizes, etc).
///
/// See: <https://github.com/espressif/esptool/blob/da31d9d/esptool.py#L655>
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SpiSetParams {
    /// Flash chip ID
    fl_id: u32,
    /// Total size in bytes
    total_size: u32,
    /// Block size
    block_size: u32,
    /// Sector size
    sector_size: u32,
    /// Page size
    page_size: u32,
    /// Status mask
    status_mask: u32,
}

impl SpiSetParams {
    pub const fn default(size: u32) -> Self {
        SpiSetParams {
            fl_id: 0,
            total_size: size,
            block_size: 64 * 1024,
            sector_size: FLASH_SECTOR_SIZE as u32,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded: Vec<u8> = Vec::new();
        encoded.extend_from_slice(&self.fl_id.to_le_bytes());
        encoded.extend_from_slice(&self.total_size.to_le_bytes());
        encoded.extend_from_slice(&self.block_size.to_le_bytes());
        encoded.extend_from_slice(&self.sector_size.to_le_bytes());
        encoded.extend_from_slice(&self.page_size.to_le_bytes());
        encoded.extend_from_slice(&self.status_mask.to_le_bytes());
        encoded
    }
}

/// Parameters for attaching to a target devices SPI flash
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    /// Use the pins configured in eFuse
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(self, stub: bool) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded: Vec<u8> = packed.to_le_bytes().to_vec();

        if !stub {
            encoded.append(&mut vec![0u8; 4]);
        }

        encoded
    }
}

/// Information about the connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// The chip being used
    pub chip: Chip,
    /// Package and revision, e.g. `ESP32D0WDQ6 (revision 1)`
    pub description: String,
    pub mac: [u8; 6],
    /// Device features
    pub features: Vec<String>,
    pub flash_manufacturer: u8,
    pub flash_device: u16,
    /// The flash size reported by the flash chip
    pub flash_size: FlashSize,
}

impl DeviceIdentity {
    /// MAC address formatted as colon separated hex
    pub fn mac_address(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Chip type:         {}", self.description)?;
        writeln!(f, "Features:          {}", self.features.join(", "))?;
        writeln!(f, "MAC address:       {}", self.mac_address())?;
        writeln!(
            f,
            "Flash:             manufacturer 0x{:02x}, device 0x{:04x}",
            self.flash_manufacturer, self.flash_device
        )?;
        match self.flash_size.bytes() {
            Some(bytes) => write!(f, "Flash size:        {}MB", bytes / 0x100000),
            None => write!(f, "Flash size:        unknown"),
        }
    }
}

/// Shared flag asking a write in progress to stop
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a write ended, short of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every image was written and verified
    Completed { written: usize },
    /// Cancelled after `completed` of `total` images were written
    Cancelled { completed: usize, total: usize },
}

/// Check that every image fits in a flash of the given size
pub fn check_fits(images: &[ImagePair], flash_size: FlashSize) -> Result<(), Error> {
    let flash_end = flash_size.bytes().ok_or(ConfigError::UnknownFlashSize)?;

    for image in images {
        if image.address as u64 + image.data.len() as u64 > flash_end as u64 {
            return Err(Error::FlashOverflow {
                file: image.name.clone(),
                offset: image.address,
                length: image.data.len(),
                flash_size: flash_end,
            });
        }
    }

    Ok(())
}

/// Writes images to the flash of a synced device
pub struct Flasher<'c> {
    connection: &'c mut Connection,
    flash_size: FlashSize,
    settings: FlashSettings,
    compress: bool,
    erase_all: bool,
    verify: bool,
    cancel: CancelToken,
}

impl<'c> Flasher<'c> {
    pub fn new(
        connection: &'c mut Connection,
        flash_size: FlashSize,
        settings: FlashSettings,
        compress: bool,
        cancel: CancelToken,
    ) -> Self {
        Flasher {
            connection,
            flash_size,
            settings,
            compress,
            erase_all: false,
            verify: false,
            cancel,
        }
    }

    /// Erase the whole chip before writing
    pub fn set_erase_all(&mut self, erase_all: bool) {
        self.erase_all = erase_all;
    }

    /// Compare every image's digest once more after the write is finalized
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    /// Write a list of images to flash
    pub fn write_bins_to_flash(
        &mut self,
        images: &[ImagePair],
        events: &mut dyn EventSink,
    ) -> Result<WriteOutcome, Error> {
        events.emit(Event::Status(
            "Verifying file sizes can fit in flash...".into(),
        ));
        check_fits(images, self.flash_size)?;

        if self.erase_all {
            events.emit(Event::Erasing);
            self.connection.erase_flash()?;
            info!("Chip erase completed");
        }

        let mut target = Esp32Target::new(
            SpiAttachParams::default(),
            self.compress,
            self.cancel.clone(),
        );
        target.begin(self.connection).flashing()?;

        let total = images.len();
        let mut written = Vec::with_capacity(total);

        for (index, image) in images.iter().enumerate() {
            match self.write_image(&mut target, index, total, image, events) {
                Ok(Some(state)) => written.push(state),
                Ok(None) => {}
                Err(Error::Cancelled) => {
                    info!("Write cancelled during image {}", index);
                    // Leave the session usable for the next write
                    if let Err(err) = target.finish(self.connection, false) {
                        warn!("Failed to finalize the cancelled write: {}", err);
                    }

                    return Ok(WriteOutcome::Cancelled {
                        completed: index,
                        total,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        target.finish(self.connection, false)?;

        if self.verify {
            events.emit(Event::Status("Verifying just-written flash...".into()));
            for state in &written {
                self.verify_digest(state, VerifyStage::ReadBack, events)?;
            }
        }

        Ok(WriteOutcome::Completed { written: total })
    }

    fn write_image(
        &mut self,
        target: &mut Esp32Target,
        index: usize,
        total: usize,
        image: &ImagePair,
        events: &mut dyn EventSink,
    ) -> Result<Option<TransferState>, Error> {
        let padded = pad(&image.data, 4, 0xff);
        if padded.is_empty() {
            events.emit(Event::Warning(format!("File {} is empty", image.name)));
            return Ok(None);
        }

        let data = patch_flash_params(&padded, image.address, &self.settings);
        debug!(
            "Image {} of {}: {} bytes at 0x{:08x}",
            index + 1,
            total,
            data.len(),
            image.address
        );

        events.emit(Event::PairStarted {
            index,
            total,
            address: image.address,
            name: image.name.clone(),
            size: data.len(),
        });
        if self.connection.personality() == Some(Personality::Rom) {
            events.emit(Event::Status("Erasing flash...".into()));
        }

        let state = target.write_segment(
            self.connection,
            Segment::new(image.address, &data),
            events,
        )?;

        events.emit(Event::PairComplete {
            index,
            address: image.address,
            size: state.uncompressed_len,
            compressed_size: state.compressed_len,
            elapsed: state.elapsed,
            rate_kbits: state.rate_kbits(),
        });

        self.verify_digest(&state, VerifyStage::Write, events)?;

        Ok(Some(state))
    }

    fn verify_digest(
        &mut self,
        state: &TransferState,
        stage: VerifyStage,
        events: &mut dyn EventSink,
    ) -> Result<(), Error> {
        let index = state.index;
        let address = state.address;

        match self
            .connection
            .flash_md5sum(address, state.uncompressed_len as u32)
        {
            Ok(actual) if actual == state.digest => {
                events.emit(Event::VerifyOk {
                    index,
                    address,
                    stage,
                });
                Ok(())
            }
            Ok(actual) => {
                events.emit(Event::VerifyFailed { index, address });
                Err(Error::VerificationFailed {
                    address,
                    expected: state.digest,
                    actual,
                })
            }
            Err(Error::UnsupportedOperation { .. }) => {
                warn!("Device cannot compute flash digests, skipping verification");
                events.emit(Event::VerifySkipped { index, address });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
