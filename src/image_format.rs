//! Preparing raw binary images for writing
//!
//! Images are written as given, with two exceptions: every image is padded to
//! a 4 byte boundary, and the header of a second stage bootloader written to
//! its usual location is patched to describe the flash actually in use.

use std::{borrow::Cow, mem::size_of};

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

use crate::flasher::FlashSettings;

const ESP_MAGIC: u8 = 0xE9;

/// Flash offset the ROM boots the second stage bootloader from
pub const BOOTLOADER_ADDRESS: u32 = 0x1000;

#[derive(Copy, Clone, Zeroable, Pod, Debug)]
#[repr(C, packed)]
struct EspCommonHeader {
    magic: u8,
    segment_count: u8,
    flash_mode: u8,
    flash_config: u8,
    entry: u32,
}

const HEADER_LEN: usize = size_of::<EspCommonHeader>();

/// A segment of data to write to the flash or to RAM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub addr: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> Segment<'a> {
    pub fn new(addr: u32, data: &'a [u8]) -> Self {
        Segment {
            addr,
            data: Cow::Borrowed(data),
        }
    }

    /// Length of the segment in bytes
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Borrow a segment
    pub fn borrow<'b>(&'b self) -> Segment<'b>
    where
        'a: 'b,
    {
        Segment {
            addr: self.addr,
            data: Cow::Borrowed(self.data.as_ref()),
        }
    }
}

/// Pad `image` with `fill` up to a multiple of `boundary` bytes
///
/// An image which is already aligned is returned as is.
pub fn pad(image: &[u8], boundary: usize, fill: u8) -> Cow<'_, [u8]> {
    if boundary == 0 || image.len() % boundary == 0 {
        return Cow::Borrowed(image);
    }

    let mut padded = image.to_vec();
    padded.resize(image.len().next_multiple_of(boundary), fill);

    Cow::Owned(padded)
}

/// Rewrite the flash mode, size and frequency in a bootloader image header
///
/// Only an image starting with the image magic byte, at least as long as the
/// header and destined for [BOOTLOADER_ADDRESS] is touched. Settings left as
/// `None` keep the value already in the image.
pub fn patch_flash_params<'a>(
    image: &'a [u8],
    address: u32,
    settings: &FlashSettings,
) -> Cow<'a, [u8]> {
    if address != BOOTLOADER_ADDRESS || image.len() < HEADER_LEN || image[0] != ESP_MAGIC {
        return Cow::Borrowed(image);
    }

    let mut header: EspCommonHeader = pod_read_unaligned(&image[..HEADER_LEN]);

    if let Some(mode) = settings.mode {
        header.flash_mode = mode as u8;
    }

    let size = settings
        .size
        .and_then(|size| size.encode_flash_size())
        .unwrap_or(header.flash_config & 0xf0);
    let freq = settings
        .freq
        .map(|freq| freq.encode_flash_frequency())
        .unwrap_or(header.flash_config & 0x0f);
    header.flash_config = size | freq;

    let mut patched = image.to_vec();
    patched[..HEADER_LEN].copy_from_slice(bytes_of(&header));

    Cow::Owned(patched)
}
