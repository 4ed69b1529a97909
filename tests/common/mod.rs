//! A simulated ESP32 behind a [Transport]
//!
//! The device answers the serial protocol the way the ROM loader and the
//! flasher stub do: it syncs, exposes the eFuse and SPI registers identify
//! reads, accepts raw and compressed flash writes into a 4 MB flash and
//! computes MD5 digests over it. Faults can be injected through
//! [SimulatedEsp32::with].

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use flashwriter::{
    config::{ImagePair, SessionConfig},
    flasher::stubs::FlashStub,
    slip,
    transport::Transport,
};
use flate2::write::ZlibDecoder;
use md5::{Digest, Md5};

pub const FLASH_SIZE: usize = 0x40_0000;
/// GigaDevice GD25Q32, 4 MB
pub const FLASH_ID: u32 = 0x16_40c8;
pub const MAC: [u8; 6] = [0x24, 0x62, 0xab, 0xcd, 0xef, 0x01];

const MAGIC_REG: u32 = 0x4000_1000;
const MAGIC_VALUE: u32 = 0x00f0_1d83;
const EFUSE_BASE: u32 = 0x3ff5_a000;
const SPI_CMD_REG: u32 = 0x3ff4_2000;
const SPI_USR2_REG: u32 = 0x3ff4_2024;
const SPI_W0_REG: u32 = 0x3ff4_2080;

const SPI_FLASH_RDID: u32 = 0x9f;

pub const OP_FLASH_BEGIN: u8 = 0x02;
pub const OP_FLASH_DATA: u8 = 0x03;
pub const OP_FLASH_END: u8 = 0x04;
pub const OP_MEM_BEGIN: u8 = 0x05;
pub const OP_MEM_END: u8 = 0x06;
pub const OP_MEM_DATA: u8 = 0x07;
pub const OP_SYNC: u8 = 0x08;
pub const OP_WRITE_REG: u8 = 0x09;
pub const OP_READ_REG: u8 = 0x0a;
pub const OP_SPI_SET_PARAMS: u8 = 0x0b;
pub const OP_SPI_ATTACH: u8 = 0x0d;
pub const OP_CHANGE_BAUDRATE: u8 = 0x0f;
pub const OP_FLASH_DEFL_BEGIN: u8 = 0x10;
pub const OP_FLASH_DEFL_DATA: u8 = 0x11;
pub const OP_FLASH_DEFL_END: u8 = 0x12;
pub const OP_FLASH_MD5: u8 = 0x13;
pub const OP_ERASE_FLASH: u8 = 0xd0;

const ERR_INVALID_MESSAGE: u8 = 0x05;
const ERR_BAD_DATA_CHECKSUM: u8 = 0xc1;
const ERR_INVALID_COMMAND: u8 = 0xc3;
const ERR_NOT_IN_FLASH_MODE: u8 = 0xc6;

/// Which loader the simulated chip is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loader {
    Rom,
    Stub,
}

struct FlashWrite {
    offset: usize,
    position: usize,
    next_sequence: u32,
    inflater: Option<ZlibDecoder<Vec<u8>>>,
}

/// State of the simulated chip
pub struct Device {
    pub flash: Vec<u8>,
    pub loader: Loader,
    /// Reset into the serial loader, as opposed to the application
    pub download_mode: bool,
    /// Stops answering anything when cleared, as if unplugged
    pub responsive: bool,
    pub md5_supported: bool,
    /// Flash address whose byte is flipped when written
    pub corrupt_address: Option<usize>,
    /// Precede every response with an empty frame
    pub empty_frames: bool,
    pub baud: u32,
    /// Opcodes of all commands received
    pub commands: Vec<u8>,
    /// Opcode and sequence number of every data block received
    pub data_blocks: Vec<(u8, u32)>,
    /// Sizes sent with the flash begin commands
    pub begin_sizes: Vec<u32>,
    /// Bytes uploaded to RAM
    pub ram_bytes: usize,
    registers: HashMap<u32, u32>,
    write: Option<FlashWrite>,
    mem_sequence: u32,
    rx: Vec<u8>,
    escaped: bool,
    tx: VecDeque<u8>,
    dtr: bool,
    rts: bool,
}

impl Device {
    fn new() -> Self {
        let mut device = Device {
            flash: vec![0xff; FLASH_SIZE],
            loader: Loader::Rom,
            download_mode: false,
            responsive: true,
            md5_supported: true,
            corrupt_address: None,
            empty_frames: false,
            baud: 115_200,
            commands: Vec::new(),
            data_blocks: Vec::new(),
            begin_sizes: Vec::new(),
            ram_bytes: 0,
            registers: HashMap::new(),
            write: None,
            mem_sequence: 0,
            rx: Vec::new(),
            escaped: false,
            tx: VecDeque::new(),
            dtr: false,
            rts: false,
        };
        device.reset_registers();

        device
    }

    fn reset_registers(&mut self) {
        let word = |n: u32| EFUSE_BASE + 4 * n;

        self.registers = HashMap::from([
            (MAGIC_REG, MAGIC_VALUE),
            (word(1), u32::from_be_bytes([MAC[2], MAC[3], MAC[4], MAC[5]])),
            (word(2), u32::from_be_bytes([0, 0, MAC[0], MAC[1]])),
            // Package ESP32D0WDQ6, revision bit 0
            (word(3), 1 << 15),
        ]);
    }

    fn reset(&mut self) {
        self.download_mode = self.dtr;
        self.loader = Loader::Rom;
        self.write = None;
        self.rx.clear();
        self.escaped = false;
        self.tx.clear();
        self.reset_registers();
    }

    fn receive(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match (self.escaped, byte) {
                (false, 0xc0) => {
                    if !self.rx.is_empty() {
                        let frame = std::mem::take(&mut self.rx);
                        self.handle(&frame);
                    }
                }
                (false, 0xdb) => self.escaped = true,
                (true, 0xdc) => {
                    self.rx.push(0xc0);
                    self.escaped = false;
                }
                (true, 0xdd) => {
                    self.rx.push(0xdb);
                    self.escaped = false;
                }
                (false, byte) => self.rx.push(byte),
                (true, _) => {
                    // Broken escape, drop the frame
                    self.rx.clear();
                    self.escaped = false;
                }
            }
        }
    }

    fn respond(&mut self, op: u8, value: u32, data: &[u8], error: Option<u8>) {
        let mut status = match error {
            Some(code) => vec![1, code],
            None => vec![0, 0],
        };
        // The ROM loader sends two more, reserved bytes
        if self.loader == Loader::Rom {
            status.extend_from_slice(&[0, 0]);
        }

        let mut packet = vec![0x01, op];
        packet.extend_from_slice(&((data.len() + status.len()) as u16).to_le_bytes());
        packet.extend_from_slice(&value.to_le_bytes());
        packet.extend_from_slice(data);
        packet.extend_from_slice(&status);

        if self.empty_frames {
            self.tx.extend(slip::encode(&[]));
        }
        self.tx.extend(slip::encode(&packet));
    }

    fn ok(&mut self, op: u8) {
        self.respond(op, 0, &[], None);
    }

    fn error(&mut self, op: u8, code: u8) {
        self.respond(op, 0, &[], Some(code));
    }

    fn handle(&mut self, frame: &[u8]) {
        if !self.download_mode || !self.responsive || frame.len() < 8 || frame[0] != 0x00 {
            return;
        }

        let op = frame[1];
        let checksum = word(frame, 4) as u8;
        let data = &frame[8..];
        self.commands.push(op);

        match op {
            OP_SYNC => {
                for _ in 0..8 {
                    self.respond(OP_SYNC, 0x2012_0707, &[], None);
                }
            }
            OP_READ_REG => {
                let value = self.registers.get(&word(data, 0)).copied().unwrap_or(0);
                self.respond(OP_READ_REG, value, &[], None);
            }
            OP_WRITE_REG => {
                self.write_reg(word(data, 0), word(data, 4), word(data, 8));
                self.ok(op);
            }
            OP_SPI_ATTACH | OP_SPI_SET_PARAMS => self.ok(op),
            OP_CHANGE_BAUDRATE => {
                self.baud = word(data, 0);
                self.ok(op);
            }
            OP_FLASH_BEGIN | OP_FLASH_DEFL_BEGIN => {
                let size = word(data, 0);
                let offset = word(data, 12) as usize;
                self.begin_sizes.push(size);

                let end = (offset + size as usize).div_ceil(0x1000) * 0x1000;
                let end = end.min(FLASH_SIZE);
                if offset < end {
                    self.flash[offset..end].fill(0xff);
                }

                self.write = Some(FlashWrite {
                    offset,
                    position: 0,
                    next_sequence: 0,
                    inflater: (op == OP_FLASH_DEFL_BEGIN).then(|| ZlibDecoder::new(Vec::new())),
                });
                self.ok(op);
            }
            OP_FLASH_DATA | OP_FLASH_DEFL_DATA => self.flash_data(op, checksum, data),
            OP_FLASH_END | OP_FLASH_DEFL_END => {
                self.write = None;
                self.ok(op);
            }
            OP_MEM_BEGIN => {
                self.mem_sequence = 0;
                self.ok(op);
            }
            OP_MEM_DATA => {
                let sequence = word(data, 4);
                self.data_blocks.push((op, sequence));
                if sequence != self.mem_sequence {
                    return self.error(op, ERR_INVALID_MESSAGE);
                }
                self.mem_sequence += 1;
                self.ram_bytes += data.len() - 16;
                self.ok(op);
            }
            OP_MEM_END => {
                let no_entry = word(data, 0);
                self.ok(op);
                if no_entry == 0 {
                    self.loader = Loader::Stub;
                    self.tx.extend(slip::encode(b"OHAI"));
                }
            }
            OP_FLASH_MD5 if self.md5_supported => {
                let offset = word(data, 0) as usize;
                let size = word(data, 4) as usize;
                let digest: [u8; 16] = Md5::digest(&self.flash[offset..offset + size]).into();

                match self.loader {
                    Loader::Rom => {
                        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
                        self.respond(op, 0, hex.as_bytes(), None);
                    }
                    Loader::Stub => self.respond(op, 0, &digest, None),
                }
            }
            OP_ERASE_FLASH if self.loader == Loader::Stub => {
                self.flash.fill(0xff);
                self.ok(op);
            }
            _ => self.error(op, ERR_INVALID_COMMAND),
        }
    }

    fn write_reg(&mut self, address: u32, value: u32, mask: u32) {
        let old = self.registers.get(&address).copied().unwrap_or(0);
        let value = (old & !mask) | (value & mask);

        if address == SPI_CMD_REG {
            // Run the SPI transaction right away, the busy bit reads back clear
            let command = self.registers.get(&SPI_USR2_REG).copied().unwrap_or(0) & 0xffff;
            if command == SPI_FLASH_RDID {
                self.registers.insert(SPI_W0_REG, FLASH_ID);
            }
            return;
        }

        self.registers.insert(address, value);
    }

    fn flash_data(&mut self, op: u8, checksum: u8, data: &[u8]) {
        let sequence = word(data, 4);
        self.data_blocks.push((op, sequence));

        let payload = &data[16..];
        let expected = payload.iter().fold(0xef, |acc, b| acc ^ b);
        if expected != checksum {
            return self.error(op, ERR_BAD_DATA_CHECKSUM);
        }

        let compressed = op == OP_FLASH_DEFL_DATA;
        let Some(write) = self
            .write
            .as_mut()
            .filter(|write| write.inflater.is_some() == compressed)
        else {
            return self.error(op, ERR_NOT_IN_FLASH_MODE);
        };

        if sequence != write.next_sequence {
            return self.error(op, ERR_INVALID_MESSAGE);
        }
        write.next_sequence += 1;

        let bytes = match write.inflater.as_mut() {
            Some(inflater) => {
                if inflater.write_all(payload).and_then(|_| inflater.flush()).is_err() {
                    return self.error(op, 0x0b);
                }
                std::mem::take(inflater.get_mut())
            }
            None => payload.to_vec(),
        };

        let start = write.offset + write.position;
        let end = (start + bytes.len()).min(FLASH_SIZE);
        write.position += bytes.len();
        self.flash[start..end].copy_from_slice(&bytes[..end - start]);

        if let Some(address) = self.corrupt_address.filter(|a| (start..end).contains(a)) {
            self.flash[address] ^= 0x01;
        }

        self.ok(op);
    }
}

fn word(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    if let Some(slice) = data.get(at..at + 4) {
        bytes.copy_from_slice(slice);
    }
    u32::from_le_bytes(bytes)
}

/// Handle to a simulated chip, shared with the transports connected to it
#[derive(Clone)]
pub struct SimulatedEsp32 {
    device: Arc<Mutex<Device>>,
}

impl SimulatedEsp32 {
    pub fn new() -> Self {
        SimulatedEsp32 {
            device: Arc::new(Mutex::new(Device::new())),
        }
    }

    /// A transport connected to this chip
    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(SimulatedPort {
            device: self.device.clone(),
            open: false,
            baud: 0,
        })
    }

    /// Inspect or change the chip's state
    pub fn with<T>(&self, f: impl FnOnce(&mut Device) -> T) -> T {
        f(&mut self.device.lock().unwrap())
    }

    pub fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        self.with(|device| device.flash[address as usize..address as usize + len].to_vec())
    }

    pub fn commands(&self) -> Vec<u8> {
        self.with(|device| device.commands.clone())
    }

    pub fn loader(&self) -> Loader {
        self.with(|device| device.loader)
    }
}

struct SimulatedPort {
    device: Arc<Mutex<Device>>,
    open: bool,
    baud: u32,
}

impl SimulatedPort {
    fn device(&self) -> std::sync::MutexGuard<'_, Device> {
        self.device.lock().unwrap()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::ErrorKind::NotConnected.into())
        }
    }
}

impl Transport for SimulatedPort {
    fn name(&self) -> String {
        "sim0".into()
    }

    fn open(&mut self, baud: u32) -> io::Result<()> {
        self.open = true;
        self.baud = baud;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        self.check_open()?;

        let mut device = self.device();
        if device.tx.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }

        let count = buf.len().min(device.tx.len());
        for (dst, src) in buf.iter_mut().zip(device.tx.drain(..count)) {
            *dst = src;
        }

        Ok(count)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.check_open()?;
        self.device().receive(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.check_open()?;
        self.device().tx.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.check_open()?;
        Ok(self.device().tx.len())
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.check_open()?;
        self.device().dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.check_open()?;
        let mut device = self.device();
        // EN is released
        if device.rts && !level {
            device.reset();
        }
        device.rts = level;
        Ok(())
    }
}

/// A small flasher stub; its text segment takes more than one RAM block
pub fn stub() -> FlashStub {
    FlashStub::new(
        0x400b_e5d8,
        (0x400b_e000, pseudo_random(0x2000, 7)),
        (0x3ffd_eba8, pseudo_random(0x300, 11)),
    )
}

/// Incompressible test data
pub fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9) | 1;

    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// A second-stage bootloader image with a valid header
pub fn bootloader_image(len: usize) -> Vec<u8> {
    let mut image = pseudo_random(len, 1);
    // Magic, segment count, DIO, 4 MB @ 40 MHz
    image[..4].copy_from_slice(&[0xe9, 0x03, 0x02, 0x20]);
    image
}

/// Bootloader, partition table and application, as a firmware build lays
/// them out
pub fn three_images() -> Vec<ImagePair> {
    vec![
        ImagePair {
            address: 0x1000,
            name: "bootloader.bin".into(),
            data: bootloader_image(0x4c00),
        },
        ImagePair {
            address: 0x8000,
            name: "partition-table.bin".into(),
            data: pseudo_random(0xc00, 2),
        },
        ImagePair {
            address: 0x10000,
            name: "app.bin".into(),
            data: pseudo_random(0x2_3000, 3),
        },
    ]
}

pub fn session_config(images: Vec<ImagePair>) -> SessionConfig {
    let mut config = SessionConfig::new("sim0", images);
    config.stub = Some(stub());
    config
}
