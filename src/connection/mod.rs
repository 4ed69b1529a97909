//! Establish a connection with a target device
//!
//! The [Connection] struct abstracts over the [Transport] and the
//! sending/decoding of commands, and provides higher-level operations with the
//! device. It also owns the session state: whether the device has been synced,
//! and whether the ROM loader or the flasher stub is answering.

use std::{
    borrow::Cow,
    collections::VecDeque,
    io::{self, Read},
    iter::zip,
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use strum::Display;

use self::{
    command::{Command, CommandType, DEFAULT_TIMEOUT, DIRECTION_RESPONSE},
    reset::{construct_reset_strategy_sequence, HardReset, ResetStrategy},
};
use crate::{
    error::{ConnectionError, Error, ProtocolError, ResultExt, RomError, RomErrorKind},
    flasher::{
        stubs::{FlashStub, EXPECTED_STUB_HANDSHAKE},
        DeviceIdentity,
        SpiAttachParams,
        SpiSetParams,
        FLASH_WRITE_SIZE,
        STUB_FLASH_WRITE_SIZE,
    },
    image_format::Segment,
    slip::{SlipDecoder, SlipEncoder},
    targets::{Chip, FlashTarget, RamTarget, CHIP_DETECT_MAGIC_REG_ADDR, MAX_RAM_BLOCK_SIZE},
    transport::Transport,
};

pub mod command;
pub mod reset;

/// Baud rate the ROM loader listens on after reset
pub const ROM_BAUD: u32 = 115_200;

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;
const MAX_RESPONSE_FRAMES: usize = 100;

/// Which loader program is answering commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Personality {
    /// The serial loader in the chip's mask ROM
    Rom,
    /// The flasher stub, uploaded to and running from RAM
    Stub,
}

impl Personality {
    /// Number of status bytes trailing every response
    pub fn status_len(self) -> usize {
        match self {
            Personality::Rom => 4,
            Personality::Stub => 2,
        }
    }

    /// Size of a flash data block
    pub fn flash_write_size(self) -> usize {
        match self {
            Personality::Rom => FLASH_WRITE_SIZE,
            Personality::Stub => STUB_FLASH_WRITE_SIZE,
        }
    }
}

/// State of the serial session with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unsynced,
    Syncing,
    Synced(Personality),
    Failed,
}

impl SessionState {
    /// The coarse view of the session shown to users
    pub fn link(&self) -> LinkStatus {
        match self {
            SessionState::Unsynced | SessionState::Failed => LinkStatus::Disconnected,
            SessionState::Syncing => LinkStatus::Connecting,
            SessionState::Synced(_) => LinkStatus::Connected,
        }
    }
}

/// Connection status as presented to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// A response from a target device following a command
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub resp: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: u32,
    /// Response data, status bytes excluded
    pub data: Vec<u8>,
    pub status: u8,
    pub error: u8,
}

impl CommandResponse {
    fn parse(frame: &[u8], status_len: usize) -> Result<Self, ProtocolError> {
        const HEADER_LEN: usize = 8;

        if frame.len() < HEADER_LEN + status_len {
            return Err(ProtocolError::ShortResponse {
                expected: HEADER_LEN + status_len,
                got: frame.len(),
            });
        }

        let body = &frame[HEADER_LEN..];
        let status_at = body.len() - status_len;

        Ok(CommandResponse {
            resp: frame[0],
            return_op: frame[1],
            return_length: u16::from_le_bytes([frame[2], frame[3]]),
            value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            data: body[..status_at].to_vec(),
            status: body[status_at],
            error: body[status_at + 1],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Flash,
    FlashDeflate,
    Mem,
}

/// A begun block transfer and the sequence number its next block must carry
#[derive(Debug)]
struct Transfer {
    kind: TransferKind,
    next_sequence: u32,
}

/// Reads from the transport, honoring a deadline for the whole frame
struct TransportReader<'a> {
    transport: &'a mut dyn Transport,
    pending: &'a mut VecDeque<u8>,
    deadline: Instant,
}

impl Read for TransportReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::ErrorKind::TimedOut.into());
            }

            let mut chunk = [0u8; 256];
            let read = self.transport.read(&mut chunk, remaining)?;
            if read == 0 {
                return Ok(0);
            }
            self.pending.extend(&chunk[..read]);
        }

        let count = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..count)) {
            *dst = src;
        }

        Ok(count)
    }
}

/// An established connection with a target device
pub struct Connection {
    transport: Box<dyn Transport>,
    decoder: SlipDecoder,
    pending: VecDeque<u8>,
    timeout: Duration,
    state: SessionState,
    consecutive_timeouts: u32,
    transfer: Option<Transfer>,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Connection {
            transport,
            decoder: SlipDecoder::new(),
            pending: VecDeque::new(),
            timeout: DEFAULT_TIMEOUT,
            state: SessionState::Unsynced,
            consecutive_timeouts: 0,
            transfer: None,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The loader answering commands, if synced
    pub fn personality(&self) -> Option<Personality> {
        match self.state {
            SessionState::Synced(personality) => Some(personality),
            _ => None,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, SessionState::Synced(_))
    }

    /// Name of the underlying port
    pub fn port_name(&self) -> String {
        self.transport.name()
    }

    /// Get the current baud rate of the transport
    pub fn baud(&self) -> u32 {
        self.transport.baud()
    }

    /// Initialize a connection with a device
    ///
    /// Opens the transport at the ROM baud rate, resets the chip into its
    /// download mode and syncs with the ROM loader, cycling through the
    /// available reset strategies.
    pub fn begin(&mut self) -> Result<(), Error> {
        self.state = SessionState::Syncing;
        self.transfer = None;
        self.consecutive_timeouts = 0;

        if let Err(err) = self.transport.open(ROM_BAUD) {
            self.state = SessionState::Failed;
            return Err(err.into());
        }

        let reset_sequence = construct_reset_strategy_sequence();

        for (_, reset_strategy) in zip(0..MAX_CONNECT_ATTEMPTS, reset_sequence.iter().cycle()) {
            match self.connect_attempt(reset_strategy.as_ref()) {
                Ok(_) => {
                    info!("Connected to {}", self.transport.name());
                    self.state = SessionState::Synced(Personality::Rom);
                    return Ok(());
                }
                Err(e) if e.is_port_closed() => {
                    self.state = SessionState::Failed;
                    return Err(e);
                }
                Err(e) => {
                    debug!("Failed to reset, error {:#?}, retrying", e);
                }
            }
        }

        self.state = SessionState::Failed;
        Err(Error::ConnectTimeout)
    }

    /// Try to connect to a device
    fn connect_attempt(&mut self, reset_strategy: &dyn ResetStrategy) -> Result<(), Error> {
        // Reset the chip to bootloader (download mode)
        reset_strategy.reset(self.transport.as_mut())?;

        for _ in 0..MAX_SYNC_ATTEMPTS {
            // Drop the boot log and any late answers to earlier attempts
            self.clear_input()?;
            self.transport.flush()?;

            match self.sync() {
                Ok(_) => return Ok(()),
                Err(e) if e.is_port_closed() => return Err(e),
                Err(_) => sleep(Duration::from_millis(50)),
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Try to sync with the device for a given timeout
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            connection.command(Command::Sync)?;

            // The ROM answers a single SYNC several times over
            sleep(Duration::from_millis(10));
            connection.clear_input()?;

            Ok(())
        })
    }

    /// Identify the connected chip and its attached flash
    pub fn identify(&mut self) -> Result<DeviceIdentity, Error> {
        if !self.is_synced() {
            return Err(ProtocolError::InvalidState("identify requires a synced session").into());
        }

        self.detect_chip()
            .and_then(|chip| chip.into_target().identify(self))
            .map_err(|err| Error::Identify(Box::new(err)))
    }

    fn detect_chip(&mut self) -> Result<Chip, Error> {
        let magic = self.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        debug!("Read chip magic value: 0x{:08x}", magic);

        Chip::from_magic(magic)
    }

    /// Upload the flasher stub to RAM and start it
    ///
    /// Only valid while the ROM loader is answering. On failure the session
    /// stays synced with the ROM loader.
    pub fn run_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        match self.state {
            SessionState::Synced(Personality::Rom) => {}
            SessionState::Synced(Personality::Stub) => {
                return Err(ProtocolError::InvalidState("the flasher stub is already running").into())
            }
            _ => return Err(ProtocolError::InvalidState("not synced with the ROM loader").into()),
        }

        self.load_stub(stub)
            .map_err(|err| Error::StubUpload(Box::new(err)))?;
        self.state = SessionState::Synced(Personality::Stub);
        info!("Flasher stub running");

        Ok(())
    }

    fn load_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        debug!("Loading flash stub, entry 0x{:08x}", stub.entry());

        let mut ram_target = RamTarget::new(Some(stub.entry()), MAX_RAM_BLOCK_SIZE);
        ram_target.begin(self).flashing()?;

        for (addr, segment) in [stub.text(), stub.data()] {
            if segment.is_empty() {
                continue;
            }
            debug!("Write {} byte stub segment at 0x{:08x}", segment.len(), addr);

            ram_target
                .write_segment(
                    self,
                    Segment {
                        addr,
                        data: Cow::Borrowed(segment),
                    },
                    &mut (),
                )
                .flashing()?;
        }

        debug!("Finish stub write");
        ram_target.finish(self, true).flashing()?;

        self.read_stub_handshake()
    }

    fn read_stub_handshake(&mut self) -> Result<(), Error> {
        self.with_timeout(DEFAULT_TIMEOUT, |connection| {
            for _ in 0..MAX_RESPONSE_FRAMES {
                let frame = connection.read_frame()?;
                if frame == EXPECTED_STUB_HANDSHAKE.as_bytes() {
                    return Ok(());
                }
                // A late MEM_END response may still be queued ahead of it
                if frame.first() != Some(&DIRECTION_RESPONSE) {
                    break;
                }
            }

            Err(Error::Connection(ConnectionError::InvalidStubHandshake))
        })
    }

    /// Reset the device into the application in flash
    ///
    /// The session has to be established again afterwards.
    pub fn hard_reset(&mut self) -> Result<(), Error> {
        sleep(Duration::from_millis(100));
        HardReset.reset(self.transport.as_mut())?;

        self.state = SessionState::Unsynced;
        self.transfer = None;

        Ok(())
    }

    /// Mark the session as failed; it must be reconnected before further use
    pub fn fail(&mut self) {
        if self.state != SessionState::Failed {
            warn!("Session with {} failed", self.transport.name());
        }
        self.state = SessionState::Failed;
        self.transfer = None;
    }

    /// Close the transport
    pub fn disconnect(&mut self) {
        self.transport.close();
        self.pending.clear();
        self.state = SessionState::Unsynced;
        self.transfer = None;
    }

    /// Probe the device with a cheap register read
    pub fn check_alive(&mut self) -> Result<(), Error> {
        let result = self.with_timeout(DEFAULT_TIMEOUT, |connection| {
            connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)
        });

        if let Err(err) = result {
            debug!("Liveness check failed: {:?}", err);
            self.fail();
            return Err(err);
        }

        Ok(())
    }

    /// Run a command with a timeout defined by the command type
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = std::mem::replace(&mut self.timeout, timeout);
        let result = f(self);
        self.timeout = old_timeout;

        result
    }

    /// Read a single SLIP frame within the current timeout
    pub(crate) fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        let mut reader = TransportReader {
            transport: self.transport.as_mut(),
            pending: &mut self.pending,
            deadline: Instant::now() + self.timeout,
        };

        // Stray delimiters on the line decode as empty frames
        let result = loop {
            match self.decoder.decode(&mut reader) {
                Ok(frame) if frame.is_empty() => continue,
                result => break result,
            }
        };

        match result {
            Ok(frame) => {
                self.consecutive_timeouts = 0;
                Ok(frame)
            }
            Err(err) => {
                let err = Error::from(err);
                self.note_failure(&err);
                Err(err)
            }
        }
    }

    /// Read the response from the transport
    pub fn read_response(&mut self) -> Result<CommandResponse, Error> {
        let frame = self.read_frame()?;
        let status_len = self
            .personality()
            .unwrap_or(Personality::Rom)
            .status_len();

        Ok(CommandResponse::parse(&frame, status_len)?)
    }

    /// Write a command to the transport
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {}", command.command_type());

        self.clear_input()?;

        let mut buffer = Vec::new();
        let mut encoder = SlipEncoder::new(&mut buffer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;

        let result = self
            .transport
            .write_all(&buffer)
            .and_then(|_| self.transport.flush());

        result.map_err(|err| {
            let err = Error::from(err);
            self.note_failure(&err);
            err
        })
    }

    /// Write a command and read the response
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        if !matches!(self.state, SessionState::Syncing | SessionState::Synced(_)) {
            return Err(ProtocolError::InvalidState("the session is not connected").into());
        }

        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        let mut last_op = 0;
        for _ in 0..MAX_RESPONSE_FRAMES {
            let response = self.read_response().for_command(ty)?;

            if response.resp != DIRECTION_RESPONSE || response.return_op != ty as u8 {
                debug!("Ignoring frame for opcode 0x{:02x}", response.return_op);
                last_op = response.return_op;
                continue;
            }

            return if response.status != 0 {
                Err(Error::RomError(RomError::new(
                    ty,
                    RomErrorKind::from(response.error),
                )))
            } else {
                Ok(response)
            };
        }

        Err(ProtocolError::UnexpectedResponse {
            expected: ty,
            got: last_op,
        }
        .into())
    }

    /// Read a register command with a timeout
    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address: reg })
        })
        .map(|response| response.value)
    }

    /// Write a register command with a timeout
    pub fn write_reg(&mut self, addr: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |connection| {
            connection.command(Command::WriteReg {
                address: addr,
                value,
                mask,
            })
        })?;

        Ok(())
    }

    /// Attach the SPI flash, using the command form the current loader expects
    pub fn spi_attach(&mut self, spi_params: SpiAttachParams) -> Result<(), Error> {
        let command = match self.personality() {
            Some(Personality::Stub) => Command::SpiAttachStub { spi_params },
            _ => Command::SpiAttach { spi_params },
        };

        self.with_timeout(CommandType::SpiAttach.timeout(), |connection| {
            connection.command(command)
        })?;

        Ok(())
    }

    /// Tell the loader the geometry of the attached flash
    pub fn spi_set_params(&mut self, total_size: u32) -> Result<(), Error> {
        let spi_params = SpiSetParams::default(total_size);

        self.with_timeout(CommandType::SpiSetParams.timeout(), |connection| {
            connection.command(Command::SpiSetParams { spi_params })
        })?;

        Ok(())
    }

    /// Change the baud rate of the loader and then of the transport
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        let personality = self
            .personality()
            .ok_or(ProtocolError::InvalidState("not synced"))?;

        debug!("Change baud to: {}", baud);

        let prior_baud = match personality {
            Personality::Stub => self.transport.baud(),
            Personality::Rom => 0,
        };

        self.with_timeout(CommandType::ChangeBaudrate.timeout(), |connection| {
            connection.command(Command::ChangeBaudrate {
                new_baud: baud,
                prior_baud,
            })
        })
        .map_err(|err| unsupported(err, CommandType::ChangeBaudrate))?;

        self.transport.open(baud)?;
        sleep(Duration::from_millis(50));
        self.clear_input()?;

        Ok(())
    }

    /// Size of the blocks written by the flash data commands
    pub fn flash_write_size(&self) -> usize {
        self.personality()
            .unwrap_or(Personality::Rom)
            .flash_write_size()
    }

    /// Begin writing `size` raw bytes at `offset`, returning the number of
    /// blocks the device expects
    pub fn flash_begin(&mut self, size: u32, offset: u32) -> Result<u32, Error> {
        let write_size = self.flash_write_size() as u32;
        let blocks = size.div_ceil(write_size);

        self.with_timeout(
            CommandType::FlashBegin.timeout_for_size(size),
            |connection| {
                connection.command(Command::FlashBegin {
                    size,
                    blocks,
                    block_size: write_size,
                    offset,
                })
            },
        )?;
        self.start_transfer(TransferKind::Flash);

        Ok(blocks)
    }

    /// Send one raw block; the last block is padded to the block size with
    /// `0xFF`
    pub fn flash_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        let pad_to = self.flash_write_size();

        self.data_block(
            TransferKind::Flash,
            sequence,
            Command::FlashData {
                data,
                pad_to,
                pad_byte: 0xff,
                sequence,
            },
            CommandType::FlashData.timeout(),
        )
    }

    /// Leave flash write mode, optionally rebooting into the application
    pub fn flash_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.with_timeout(CommandType::FlashEnd.timeout(), |connection| {
            connection.command(Command::FlashEnd { reboot })
        })?;
        self.transfer = None;

        Ok(())
    }

    /// Begin writing `size` bytes, sent as `compressed_size` bytes of zlib
    /// data, at `offset`. Returns the number of blocks the device expects.
    pub fn flash_defl_begin(
        &mut self,
        size: u32,
        compressed_size: u32,
        offset: u32,
    ) -> Result<u32, Error> {
        let flash_write_size = self.flash_write_size() as u32;
        let blocks = compressed_size.div_ceil(flash_write_size);
        let erase_blocks = size.div_ceil(flash_write_size);

        let (write_size, timeout) = match self.personality() {
            // The stub takes the uncompressed size and erases as it goes
            Some(Personality::Stub) => (size, CommandType::FlashDeflBegin.timeout()),
            // The ROM erases everything up front
            _ => {
                let write_size = erase_blocks * flash_write_size;
                (
                    write_size,
                    CommandType::FlashDeflBegin.timeout_for_size(write_size),
                )
            }
        };
        debug!(
            "Compressed {} bytes to {}, {} blocks",
            size, compressed_size, blocks
        );

        self.with_timeout(timeout, |connection| {
            connection.command(Command::FlashDeflBegin {
                size: write_size,
                blocks,
                block_size: flash_write_size,
                offset,
            })
        })?;
        self.start_transfer(TransferKind::FlashDeflate);

        Ok(blocks)
    }

    /// Send one block of compressed data
    pub fn flash_defl_block(
        &mut self,
        data: &[u8],
        sequence: u32,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.data_block(
            TransferKind::FlashDeflate,
            sequence,
            Command::FlashDeflData {
                data,
                pad_to: 0,
                pad_byte: 0xff,
                sequence,
            },
            timeout,
        )
    }

    /// Leave compressed flash write mode, optionally rebooting into the
    /// application
    pub fn flash_defl_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.with_timeout(CommandType::FlashDeflEnd.timeout(), |connection| {
            connection.command(Command::FlashDeflEnd { reboot })
        })?;
        self.transfer = None;

        Ok(())
    }

    /// MD5 digest of a region of flash, as computed by the device
    pub fn flash_md5sum(&mut self, address: u32, size: u32) -> Result<[u8; 16], Error> {
        let response = self
            .with_timeout(
                CommandType::FlashMd5.timeout_for_size(size),
                |connection| {
                    connection.command(Command::FlashMd5 {
                        offset: address,
                        size,
                    })
                },
            )
            .map_err(|err| unsupported(err, CommandType::FlashMd5))?;

        let malformed = || ProtocolError::MalformedResponse {
            command: CommandType::FlashMd5,
        };

        match response.data.len() {
            // The ROM answers with the digest as ASCII hex
            32 => std::str::from_utf8(&response.data)
                .ok()
                .and_then(|text| u128::from_str_radix(text, 16).ok())
                .map(u128::to_be_bytes)
                .ok_or_else(|| malformed().into()),
            // The stub answers with the raw digest
            16 => {
                let mut digest = [0u8; 16];
                digest.copy_from_slice(&response.data);
                Ok(digest)
            }
            _ => Err(malformed().into()),
        }
    }

    /// Erase the entire flash chip; requires the stub
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        if self.personality() != Some(Personality::Stub) {
            return Err(Error::StubRequired);
        }
        debug!("Erasing the flash");

        self.with_timeout(CommandType::EraseFlash.timeout(), |connection| {
            connection.command(Command::EraseFlash)
        })?;

        Ok(())
    }

    /// Begin uploading `size` bytes to RAM at `offset`
    pub fn mem_begin(
        &mut self,
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    ) -> Result<(), Error> {
        self.command(Command::MemBegin {
            size,
            blocks,
            block_size,
            offset,
        })?;
        self.start_transfer(TransferKind::Mem);

        Ok(())
    }

    /// Send one block of data to RAM
    pub fn mem_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.data_block(
            TransferKind::Mem,
            sequence,
            Command::MemData {
                data,
                pad_to: 0,
                pad_byte: 0,
                sequence,
            },
            CommandType::MemData.timeout(),
        )
    }

    /// Leave RAM download mode, jumping to `entry` if it is not zero
    pub fn mem_finish(&mut self, entry: u32) -> Result<(), Error> {
        let is_stub = self.personality() == Some(Personality::Stub);
        let timeout = if is_stub {
            DEFAULT_TIMEOUT
        } else {
            CommandType::MemEnd.timeout()
        };

        let result = self.with_timeout(timeout, |connection| {
            connection.command(Command::MemEnd {
                no_entry: entry == 0,
                entry,
            })
        });
        self.transfer = None;

        match result {
            // The ROM may jump to the entry point before answering
            Err(err) if !is_stub && err.is_timeout() => {
                debug!("No answer to MEM_END from the ROM loader");
                Ok(())
            }
            Err(err) => Err(err),
            Ok(_) => Ok(()),
        }
    }

    /// Flush the transport
    pub fn flush(&mut self) -> Result<(), Error> {
        self.transport.flush()?;
        Ok(())
    }

    /// Discard anything received but not yet read
    pub fn clear_input(&mut self) -> Result<(), Error> {
        self.pending.clear();
        self.transport.clear_input()?;
        Ok(())
    }

    fn start_transfer(&mut self, kind: TransferKind) {
        self.transfer = Some(Transfer {
            kind,
            next_sequence: 0,
        });
    }

    fn data_block(
        &mut self,
        kind: TransferKind,
        sequence: u32,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<(), Error> {
        match &self.transfer {
            Some(transfer) if transfer.kind == kind => {
                if transfer.next_sequence != sequence {
                    return Err(ProtocolError::OutOfSequence {
                        expected: transfer.next_sequence,
                        got: sequence,
                    }
                    .into());
                }
            }
            _ => {
                return Err(
                    ProtocolError::InvalidState("no matching transfer has begun").into(),
                )
            }
        }

        self.with_timeout(timeout, |connection| connection.command(command))?;

        if let Some(transfer) = self.transfer.as_mut() {
            transfer.next_sequence += 1;
        }

        Ok(())
    }

    fn note_failure(&mut self, err: &Error) {
        if err.is_port_closed() {
            self.fail();
        } else if err.is_timeout() && self.is_synced() {
            self.consecutive_timeouts += 1;
            if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                warn!(
                    "{} consecutive timeouts, giving up on the session",
                    self.consecutive_timeouts
                );
                self.fail();
            }
        }
    }
}

/// A device rejecting an optional command means it does not implement it
fn unsupported(err: Error, command: CommandType) -> Error {
    match err {
        Error::RomError(_) => Error::UnsupportedOperation { command },
        err => err,
    }
}
