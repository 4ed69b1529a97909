use std::time::{Duration, Instant};

use md5::{Digest, Md5};

pub(crate) use self::ram::MAX_RAM_BLOCK_SIZE;
pub use self::{esp32::Esp32Target, ram::RamTarget};
use crate::{connection::Connection, events::EventSink, image_format::Segment, Error};

mod esp32;
mod ram;

/// Progress of one segment through a [FlashTarget]
#[derive(Debug, Clone)]
pub struct TransferState {
    /// Position of the segment among those written by the target
    pub index: usize,
    pub address: u32,
    /// Sequence number the next block would carry
    pub next_sequence: u32,
    /// Uncompressed bytes written
    pub bytes_written: usize,
    pub uncompressed_len: usize,
    /// Length of the compressed stream, if the segment was compressed
    pub compressed_len: Option<usize>,
    /// Uncompressed to compressed size
    pub ratio: f64,
    pub started: Instant,
    pub elapsed: Duration,
    /// MD5 digest of the uncompressed segment
    pub digest: [u8; 16],
}

impl TransferState {
    pub(crate) fn new(index: usize, segment: &Segment<'_>) -> Self {
        let mut md5_hasher = Md5::new();
        md5_hasher.update(&segment.data);

        TransferState {
            index,
            address: segment.addr,
            next_sequence: 0,
            bytes_written: 0,
            uncompressed_len: segment.data.len(),
            compressed_len: None,
            ratio: 1.0,
            started: Instant::now(),
            elapsed: Duration::ZERO,
            digest: md5_hasher.finalize().into(),
        }
    }

    /// Effective transfer rate in kbit/s, counting uncompressed bytes
    pub fn rate_kbits(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }

        self.uncompressed_len as f64 / secs * 8.0 / 1000.0
    }
}

/// Operations for interacting with a flash target
pub trait FlashTarget {
    /// Begin the flashing operation
    fn begin(&mut self, connection: &mut Connection) -> Result<(), Error>;

    /// Write a segment to the target device
    fn write_segment(
        &mut self,
        connection: &mut Connection,
        segment: Segment<'_>,
        events: &mut dyn EventSink,
    ) -> Result<TransferState, Error>;

    /// Complete the flashing operation
    fn finish(&mut self, connection: &mut Connection, reboot: bool) -> Result<(), Error>;
}
