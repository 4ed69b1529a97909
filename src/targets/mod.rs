//! Flashable target devices
//!
//! The ESP32 is the only supported device. Its ROM loader can write images to
//! the SPI flash attached to it, or download a program to RAM and execute it;
//! both are exposed as a [FlashTarget].

use std::{thread::sleep, time::Duration};

use log::debug;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

pub use self::{
    esp32::Esp32,
    flash_target::{Esp32Target, FlashTarget, RamTarget, TransferState},
};
pub(crate) use self::flash_target::MAX_RAM_BLOCK_SIZE;
use crate::{
    connection::{command::CommandType, Connection},
    error::{ConnectionError, Error},
    flasher::{DeviceIdentity, FlashSize, SpiAttachParams},
};

mod esp32;
mod flash_target;

/// Address of the register holding the chip's magic value
pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// All supported devices
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// ESP32
    #[default]
    Esp32,
}

impl Chip {
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        if Esp32::has_magic_value(magic) {
            Ok(Chip::Esp32)
        } else {
            Err(Error::ChipDetectError(magic))
        }
    }

    pub fn into_target(&self) -> Box<dyn Target> {
        match self {
            Chip::Esp32 => Box::new(Esp32),
        }
    }
}

/// SPI register addresses
#[derive(Debug)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: u32,
    miso_length_offset: u32,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> u32 {
        self.base + self.mosi_length_offset
    }

    pub fn miso_length(&self) -> u32 {
        self.base + self.miso_length_offset
    }
}

/// Enable the reading of eFuses for a target
pub trait ReadEFuse {
    /// Returns the base address of the eFuse register
    fn efuse_reg(&self) -> u32;

    /// Given an active connection, read the nth word of the eFuse region
    fn read_efuse(&self, connection: &mut Connection, n: u32) -> Result<u32, Error> {
        let reg = self.efuse_reg() + (n * 0x4);
        connection.read_reg(reg)
    }
}

/// Operations for interacting with supported target devices
pub trait Target: ReadEFuse {
    /// The chip this target describes
    fn chip(&self) -> Chip;

    /// Enumerate the chip's features, read from eFuse
    fn chip_features(&self, connection: &mut Connection) -> Result<Vec<&str>, Error>;

    /// Determine the chip's revision number
    fn chip_revision(&self, connection: &mut Connection) -> Result<u32, Error>;

    /// Package name and revision, e.g. `ESP32D0WDQ6 (revision 1)`
    fn chip_description(&self, connection: &mut Connection) -> Result<String, Error>;

    /// What is the MAC address?
    fn mac_address(&self, connection: &mut Connection) -> Result<[u8; 6], Error>;

    /// SPI register addresses for a chip
    fn spi_registers(&self) -> SpiRegisters;

    /// Run a command on the attached SPI flash through the SPI peripheral,
    /// returning up to 32 bits read back
    fn spi_command(
        &self,
        connection: &mut Connection,
        command: CommandType,
        data: &[u8],
        read_bits: u32,
    ) -> Result<u32, Error> {
        assert!(read_bits < 32);
        assert!(data.len() < 64);

        let spi_registers = self.spi_registers();

        let old_spi_usr = connection.read_reg(spi_registers.usr())?;
        let old_spi_usr2 = connection.read_reg(spi_registers.usr2())?;

        let mut flags = 1 << 31;
        if !data.is_empty() {
            flags |= 1 << 27;
        }
        if read_bits > 0 {
            flags |= 1 << 28;
        }

        connection.write_reg(spi_registers.usr(), flags, None)?;
        connection.write_reg(spi_registers.usr2(), (7 << 28) | command as u32, None)?;

        if !data.is_empty() {
            connection.write_reg(spi_registers.mosi_length(), data.len() as u32 * 8 - 1, None)?;
        }
        if read_bits > 0 {
            connection.write_reg(spi_registers.miso_length(), read_bits - 1, None)?;
        }

        if data.is_empty() {
            connection.write_reg(spi_registers.w0(), 0, None)?;
        } else {
            for (i, bytes) in data.chunks(4).enumerate() {
                let mut data_bytes = [0; 4];
                data_bytes[0..bytes.len()].copy_from_slice(bytes);
                let data = u32::from_le_bytes(data_bytes);
                connection.write_reg(spi_registers.w0() + 4 * i as u32, data, None)?;
            }
        }

        connection.write_reg(spi_registers.cmd(), 1 << 18, None)?;

        let mut i = 0;
        loop {
            sleep(Duration::from_millis(1));
            if connection.read_reg(spi_registers.usr())? & (1 << 18) == 0 {
                break;
            }
            i += 1;
            if i > 10 {
                return Err(Error::Connection(ConnectionError::Timeout(command.into())));
            }
        }

        let result = connection.read_reg(spi_registers.w0())?;
        connection.write_reg(spi_registers.usr(), old_spi_usr, None)?;
        connection.write_reg(spi_registers.usr2(), old_spi_usr2, None)?;

        Ok(result)
    }

    /// Read the JEDEC id of the attached flash
    fn flash_id(&self, connection: &mut Connection) -> Result<u32, Error> {
        self.spi_command(connection, CommandType::FlashDetect, &[], 24)
    }

    /// Attach the flash and read everything known about the device
    fn identify(&self, connection: &mut Connection) -> Result<DeviceIdentity, Error> {
        connection.spi_attach(SpiAttachParams::default())?;

        let mac = self.mac_address(connection)?;
        let features = self
            .chip_features(connection)?
            .iter()
            .map(|s| s.to_string())
            .collect();
        let description = self.chip_description(connection)?;

        let flash_id = self.flash_id(connection)?;
        debug!("Flash ID: 0x{:06x}", flash_id);

        let flash_manufacturer = (flash_id & 0xff) as u8;
        let flash_device = ((((flash_id >> 8) & 0xff) << 8) | ((flash_id >> 16) & 0xff)) as u16;
        let flash_size = FlashSize::from_detected((flash_id >> 16) as u8);

        Ok(DeviceIdentity {
            chip: self.chip(),
            description,
            mac,
            features,
            flash_manufacturer,
            flash_device,
            flash_size,
        })
    }
}
