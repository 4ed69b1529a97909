use std::io::Write;

use flate2::{write::ZlibEncoder, Compression};
use log::debug;

use super::TransferState;
use crate::{
    connection::{command::DEFAULT_TIMEOUT, Connection, Personality},
    error::{Error, ResultExt},
    events::{Event, EventSink},
    flasher::{CancelToken, SpiAttachParams},
    image_format::Segment,
    targets::FlashTarget,
};

/// Per-block timeout of a compressed write, as a multiple of the default
/// timeout scaled by the compression ratio
pub const COMPRESSED_BLOCK_TIMEOUT_FACTOR: f64 = 2.0;

/// Images written to the SPI flash attached to an ESP32
pub struct Esp32Target {
    spi_attach_params: SpiAttachParams,
    compress: bool,
    cancel: CancelToken,
    next_index: usize,
}

impl Esp32Target {
    pub fn new(spi_attach_params: SpiAttachParams, compress: bool, cancel: CancelToken) -> Self {
        Esp32Target {
            spi_attach_params,
            compress,
            cancel,
            next_index: 0,
        }
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl FlashTarget for Esp32Target {
    fn begin(&mut self, connection: &mut Connection) -> Result<(), Error> {
        connection.spi_attach(self.spi_attach_params)
    }

    fn write_segment(
        &mut self,
        connection: &mut Connection,
        segment: Segment<'_>,
        events: &mut dyn EventSink,
    ) -> Result<TransferState, Error> {
        let addr = segment.addr;
        let mut state = TransferState::new(self.next_index, &segment);
        self.next_index += 1;

        let flash_write_size = connection.flash_write_size();

        // The stream sent to the device, compressed or not
        let compressed;
        let (stream, blocks) = if self.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(&segment.data)?;
            compressed = encoder.finish()?;

            state.compressed_len = Some(compressed.len());
            state.ratio = segment.data.len() as f64 / compressed.len() as f64;

            let blocks = connection
                .flash_defl_begin(segment.size(), compressed.len() as u32, addr)
                .flashing()?;

            (compressed.as_slice(), blocks)
        } else {
            let blocks = connection.flash_begin(segment.size(), addr).flashing()?;

            (segment.data.as_ref(), blocks)
        };

        let block_timeout = DEFAULT_TIMEOUT
            .mul_f64(state.ratio * COMPRESSED_BLOCK_TIMEOUT_FACTOR)
            .max(DEFAULT_TIMEOUT);

        for (i, block) in stream.chunks(flash_write_size).enumerate() {
            self.check_cancelled()?;

            let sequence = i as u32;
            events.emit(Event::WritingBlock {
                address: addr,
                block_address: addr + sequence * flash_write_size as u32,
                block: sequence,
                blocks,
                percent: 100 * (sequence + 1) / blocks,
            });

            if self.compress {
                connection
                    .flash_defl_block(block, sequence, block_timeout)
                    .flashing()?;
            } else {
                connection.flash_block(block, sequence).flashing()?;
            }

            state.next_sequence += 1;
            state.bytes_written = if self.compress {
                // Blocks of the compressed stream stand for an even share of the image
                (state.uncompressed_len * (i + 1)).div_ceil(blocks as usize)
            } else {
                state.bytes_written + block.len()
            }
            .min(state.uncompressed_len);
        }

        // Also observed once the last block is out
        self.check_cancelled()?;

        state.elapsed = state.started.elapsed();
        debug!(
            "Wrote {} bytes at 0x{:08x} in {} blocks",
            state.uncompressed_len, addr, state.next_sequence
        );

        Ok(state)
    }

    fn finish(&mut self, connection: &mut Connection, reboot: bool) -> Result<(), Error> {
        // The ROM loader would exit and boot the application on FLASH_END
        if connection.personality() != Some(Personality::Stub) {
            return Ok(());
        }

        connection.flash_begin(0, 0).flashing()?;
        if self.compress {
            connection.flash_defl_finish(reboot).flashing()
        } else {
            connection.flash_finish(reboot).flashing()
        }
    }
}
