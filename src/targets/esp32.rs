use super::{Chip, ReadEFuse, SpiRegisters, Target};
use crate::{connection::Connection, error::Error};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x00f0_1d83];

const APB_CTL_DATE_REG: u32 = 0x3ff6_607c;

/// ESP32 Target
pub struct Esp32;

impl Esp32 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }

    /// Return the package version based on the eFuses
    fn package_version(&self, connection: &mut Connection) -> Result<u32, Error> {
        let word3 = self.read_efuse(connection, 3)?;

        let pkg_version = (word3 >> 9) & 0x7;
        let pkg_version = pkg_version + (((word3 >> 2) & 0x1) << 3);

        Ok(pkg_version)
    }
}

impl ReadEFuse for Esp32 {
    fn efuse_reg(&self) -> u32 {
        0x3ff5_a000
    }
}

impl Target for Esp32 {
    fn chip(&self) -> Chip {
        Chip::Esp32
    }

    fn chip_features(&self, connection: &mut Connection) -> Result<Vec<&str>, Error> {
        let word3 = self.read_efuse(connection, 3)?;
        let word4 = self.read_efuse(connection, 4)?;
        let word6 = self.read_efuse(connection, 6)?;

        let mut features = vec!["WiFi"];

        let chip_ver_dis_bt = word3 & 0x2;
        if chip_ver_dis_bt == 0 {
            features.push("BT");
        }

        let chip_ver_dis_app_cpu = word3 & 0x1;
        if chip_ver_dis_app_cpu == 0 {
            features.push("Dual Core");
        } else {
            features.push("Single Core");
        }

        let chip_cpu_freq_rated = word3 & (1 << 13);
        if chip_cpu_freq_rated != 0 {
            let chip_cpu_freq_low = word3 & (1 << 12);
            if chip_cpu_freq_low != 0 {
                features.push("160MHz");
            } else {
                features.push("240MHz");
            }
        }

        let pkg_version = self.package_version(connection)?;
        if [2, 4, 5, 6].contains(&pkg_version) {
            features.push("Embedded Flash");
        }
        if pkg_version == 6 {
            features.push("Embedded PSRAM");
        }

        let adc_vref = (word4 >> 8) & 0x1;
        if adc_vref != 0 {
            features.push("VRef calibration in efuse");
        }

        let blk3_part_res = (word3 >> 14) & 0x1;
        if blk3_part_res != 0 {
            features.push("BLK3 partially reserved");
        }

        let coding_scheme = word6 & 0x3;
        features.push(match coding_scheme {
            0 => "Coding Scheme None",
            1 => "Coding Scheme 3/4",
            2 => "Coding Scheme Repeat (UNSUPPORTED)",
            _ => "Coding Scheme Invalid",
        });

        Ok(features)
    }

    fn chip_revision(&self, connection: &mut Connection) -> Result<u32, Error> {
        let apb_ctl_date = connection.read_reg(APB_CTL_DATE_REG)?;

        let word3 = self.read_efuse(connection, 3)?;
        let word5 = self.read_efuse(connection, 5)?;

        let rev_bit0 = (word3 >> 15) & 0x1;
        let rev_bit1 = (word5 >> 20) & 0x1;
        let rev_bit2 = (apb_ctl_date >> 31) & 0x1;

        let combine_value = (rev_bit2 << 2) | (rev_bit1 << 1) | rev_bit0;

        match combine_value {
            1 => Ok(1),
            3 => Ok(2),
            7 => Ok(3),
            _ => Ok(0),
        }
    }

    fn chip_description(&self, connection: &mut Connection) -> Result<String, Error> {
        let package = match self.package_version(connection)? {
            0 => "ESP32D0WDQ6",
            1 => "ESP32D0WDQ5",
            2 => "ESP32D2WDQ5",
            5 => "ESP32-PICO-D4",
            _ => "unknown ESP32",
        };
        let revision = self.chip_revision(connection)?;

        Ok(format!("{package} (revision {revision})"))
    }

    fn mac_address(&self, connection: &mut Connection) -> Result<[u8; 6], Error> {
        let word1 = self.read_efuse(connection, 1)?;
        let word2 = self.read_efuse(connection, 2)?;

        let bytes = ((word2 as u64) << 32) | word1 as u64;
        let bytes = bytes.to_be_bytes();

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[2..]);

        Ok(mac)
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x3ff4_2000,
            usr_offset: 0x1c,
            usr2_offset: 0x24,
            w0_offset: 0x80,
            mosi_length_offset: 0x28,
            miso_length_offset: 0x2c,
        }
    }
}
