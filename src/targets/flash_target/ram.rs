use log::debug;

use super::TransferState;
use crate::{
    connection::Connection,
    events::EventSink,
    image_format::Segment,
    targets::FlashTarget,
    Error,
};

pub const MAX_RAM_BLOCK_SIZE: usize = 0x1800;

/// Programs running from the target device's RAM
#[derive(Debug)]
pub struct RamTarget {
    entry: Option<u32>,
    block_size: usize,
    next_index: usize,
}

impl RamTarget {
    pub fn new(entry: Option<u32>, block_size: usize) -> Self {
        RamTarget {
            entry,
            block_size,
            next_index: 0,
        }
    }
}

impl Default for RamTarget {
    fn default() -> Self {
        Self::new(None, MAX_RAM_BLOCK_SIZE)
    }
}

impl FlashTarget for RamTarget {
    fn begin(&mut self, _connection: &mut Connection) -> Result<(), Error> {
        Ok(())
    }

    fn write_segment(
        &mut self,
        connection: &mut Connection,
        segment: Segment<'_>,
        _events: &mut dyn EventSink,
    ) -> Result<TransferState, Error> {
        let mut state = TransferState::new(self.next_index, &segment);
        self.next_index += 1;

        let block_count = segment.data.len().div_ceil(self.block_size);

        connection.mem_begin(
            segment.size(),
            block_count as u32,
            self.block_size as u32,
            segment.addr,
        )?;

        for (i, block) in segment.data.chunks(self.block_size).enumerate() {
            connection.mem_block(block, i as u32)?;

            state.next_sequence += 1;
            state.bytes_written += block.len();
        }
        debug!(
            "Wrote {} bytes to RAM at 0x{:08x}",
            state.bytes_written, segment.addr
        );

        state.elapsed = state.started.elapsed();

        Ok(state)
    }

    fn finish(&mut self, connection: &mut Connection, reboot: bool) -> Result<(), Error> {
        if reboot {
            connection.mem_finish(self.entry.unwrap_or_default())?;
        }

        Ok(())
    }
}
