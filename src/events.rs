//! Progress and status events emitted while working with a device
//!
//! Every event renders as the status line a user would see for it, so a
//! front-end can simply print them.

use std::{fmt, sync::mpsc::Sender, time::Duration};

use crate::flasher::DeviceIdentity;

/// Which verification pass an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStage {
    /// Digest compared right after writing the image
    Write,
    /// Digest compared again after the write was finalized
    ReadBack,
}

/// Something that happened during a session
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connecting {
        port: String,
    },
    Connected(DeviceIdentity),
    ConnectFailed {
        reason: String,
    },
    StubLoaded,
    BaudChanged {
        baud: u32,
    },
    Erasing,
    PairStarted {
        index: usize,
        total: usize,
        address: u32,
        name: String,
        size: usize,
    },
    WritingBlock {
        /// Address of the image being written
        address: u32,
        /// Address the block is nominally written to
        block_address: u32,
        block: u32,
        blocks: u32,
        percent: u32,
    },
    PairComplete {
        index: usize,
        address: u32,
        size: usize,
        compressed_size: Option<usize>,
        elapsed: Duration,
        rate_kbits: f64,
    },
    VerifyOk {
        index: usize,
        address: u32,
        stage: VerifyStage,
    },
    VerifyFailed {
        index: usize,
        address: u32,
    },
    VerifySkipped {
        index: usize,
        address: u32,
    },
    Warning(String),
    Status(String),
    Cancelled {
        completed: usize,
        total: usize,
    },
    Disconnected,
    Done,
    Failed(String),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Connecting { port } => write!(f, "Connecting to {port}..."),
            Event::Connected(identity) => write!(f, "Connected to {}", identity.description),
            Event::ConnectFailed { reason } => write!(f, "Failed to connect: {reason}"),
            Event::StubLoaded => write!(f, "Stub running..."),
            Event::BaudChanged { baud } => write!(f, "Changed baud rate to {baud}"),
            Event::Erasing => write!(f, "Erasing flash (this may take a while)..."),
            Event::PairStarted { name, address, .. } => {
                write!(f, "Writing {name} at 0x{address:08x}...")
            }
            Event::WritingBlock {
                block_address,
                percent,
                ..
            } => write!(f, "Writing at 0x{block_address:08x}... ({percent} %)"),
            Event::PairComplete {
                address,
                size,
                compressed_size: Some(compressed),
                elapsed,
                rate_kbits,
                ..
            } => write!(
                f,
                "Wrote {size} bytes ({compressed} compressed) at 0x{address:08x} in {:.1} seconds (effective {rate_kbits:.1} kbit/s)...",
                elapsed.as_secs_f64()
            ),
            Event::PairComplete {
                address,
                size,
                compressed_size: None,
                elapsed,
                rate_kbits,
                ..
            } => write!(
                f,
                "Wrote {size} bytes at 0x{address:08x} in {:.1} seconds ({rate_kbits:.1} kbit/s)...",
                elapsed.as_secs_f64()
            ),
            Event::VerifyOk {
                stage: VerifyStage::Write,
                ..
            } => write!(f, "Hash of data verified."),
            Event::VerifyOk {
                stage: VerifyStage::ReadBack,
                address,
                ..
            } => write!(f, "-- verify OK (digest matched) at 0x{address:08x}"),
            Event::VerifyFailed { address, .. } => {
                write!(f, "MD5 of data does not match data in flash at 0x{address:08x}")
            }
            Event::VerifySkipped { address, .. } => write!(
                f,
                "WARNING: the device cannot compute digests, data at 0x{address:08x} was not verified"
            ),
            Event::Warning(message) => write!(f, "WARNING: {message}"),
            Event::Status(message) => write!(f, "{message}"),
            Event::Cancelled { completed, total } => {
                write!(f, "Cancelled after writing {completed} of {total} images")
            }
            Event::Disconnected => write!(f, "Disconnected"),
            Event::Done => write!(f, "Done"),
            Event::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

/// Receives the events of a session
pub trait EventSink {
    fn emit(&mut self, event: Event);
}

/// Discards all events
impl EventSink for () {
    fn emit(&mut self, _event: Event) {}
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

/// Forwards events to a receiver, which may have gone away
impl EventSink for Sender<Event> {
    fn emit(&mut self, event: Event) {
        let _ = self.send(event);
    }
}

impl<T: EventSink + ?Sized> EventSink for &mut T {
    fn emit(&mut self, event: Event) {
        (**self).emit(event);
    }
}
