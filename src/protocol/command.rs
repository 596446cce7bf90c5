//! Command header and bucket messages.
//!
//! ```text
//! IMAGE_DATA:
//! ┌──────┬──────────┬────────┬────────┬────────┬────────┬──────────────────┐
//! │ 104  │ reserved │ w_xmin │ w_xmax │ w_ymin │ w_ymax │ float32 pixels   │
//! │ 1 B  │ 1 B      │ u32 BE │ u32 BE │ u32 BE │ u32 BE │ w*h*pixel_size B │
//! └──────┴──────────┴────────┴────────┴────────┴────────┴──────────────────┘
//!
//! IMAGE_END:
//! ┌──────┬──────────┐
//! │ 105  │ reserved │
//! └──────┴──────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::PixelByteOrder;
use crate::error::{Error, Result};
use crate::framebuffer::Bucket;

use super::{COMMAND_HEADER_LEN, FramebufferDescriptor, IMAGE_DATA, IMAGE_END, RECT_LEN};

// ============================================================================
// Rect
// ============================================================================

/// Inclusive pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Leftmost column.
    pub xmin: u32,
    /// Rightmost column.
    pub xmax: u32,
    /// First row.
    pub ymin: u32,
    /// Last row.
    pub ymax: u32,
}

impl Rect {
    /// Creates a rectangle from inclusive bounds.
    #[inline]
    #[must_use]
    pub const fn new(xmin: u32, xmax: u32, ymin: u32, ymax: u32) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// Returns the width in pixels, zero if inverted.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> u64 {
        (self.xmax as u64 + 1).saturating_sub(self.xmin as u64)
    }

    /// Returns the height in pixels, zero if inverted.
    #[inline]
    #[must_use]
    pub const fn height(&self) -> u64 {
        (self.ymax as u64 + 1).saturating_sub(self.ymin as u64)
    }

    /// Returns the pixel count.
    #[inline]
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width().saturating_mul(self.height())
    }

    /// Returns `true` if min does not exceed max on either axis.
    #[inline]
    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        self.xmin <= self.xmax && self.ymin <= self.ymax
    }

    /// Returns `true` if `other` lies entirely inside `self`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, other: &Rect) -> bool {
        other.is_well_formed()
            && other.xmin >= self.xmin
            && other.xmax <= self.xmax
            && other.ymin >= self.ymin
            && other.ymax <= self.ymax
    }

    /// Decodes the 16-byte `IMAGE_DATA` rectangle.
    #[must_use]
    pub fn decode(bytes: &[u8; RECT_LEN]) -> Self {
        let word = |i: usize| {
            u32::from_be_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        Self::new(word(0), word(1), word(2), word(3))
    }

    /// Encodes the 16-byte `IMAGE_DATA` rectangle.
    #[must_use]
    pub fn encode(&self) -> [u8; RECT_LEN] {
        let mut out = [0u8; RECT_LEN];
        for (chunk, word) in out
            .chunks_exact_mut(4)
            .zip([self.xmin, self.xmax, self.ymin, self.ymax])
        {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..={}]x[{}..={}]",
            self.xmin, self.xmax, self.ymin, self.ymax
        )
    }
}

// ============================================================================
// Command
// ============================================================================

/// Command decoded from a two-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// A bucket follows.
    ImageData,
    /// End of stream.
    ImageEnd,
    /// Code outside the protocol.
    Unknown(u8),
}

impl Command {
    /// Maps a command code.
    #[inline]
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            IMAGE_DATA => Self::ImageData,
            IMAGE_END => Self::ImageEnd,
            other => Self::Unknown(other),
        }
    }

    /// Returns the command code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::ImageData => IMAGE_DATA,
            Self::ImageEnd => IMAGE_END,
            Self::Unknown(code) => code,
        }
    }

    /// Returns the two-byte header for this command.
    #[inline]
    #[must_use]
    pub const fn header_bytes(self) -> [u8; COMMAND_HEADER_LEN] {
        [self.code(), 0]
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Reads a command header.
///
/// # Errors
///
/// Returns [`Error::ConnectionClosed`] if the stream ends inside the header.
pub async fn read_command<R>(reader: &mut R) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; COMMAND_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    Ok(Command::from_code(header[0]))
}

/// Reads an `IMAGE_DATA` payload following its header.
///
/// The rectangle is checked against the framebuffer bounds before any
/// pixel byte is read, so a hostile rectangle never drives an allocation.
///
/// # Errors
///
/// - [`Error::Protocol`] if the rectangle is inverted
/// - [`Error::BucketOutOfBounds`] if it leaves the framebuffer
/// - [`Error::Resource`] if the payload buffer cannot be allocated
/// - [`Error::ConnectionClosed`] if the stream ends mid-bucket
pub async fn read_image_data<R>(reader: &mut R, descriptor: &FramebufferDescriptor) -> Result<Bucket>
where
    R: AsyncRead + Unpin,
{
    let mut rect_bytes = [0u8; RECT_LEN];
    reader.read_exact(&mut rect_bytes).await?;
    let rect = Rect::decode(&rect_bytes);

    if !rect.is_well_formed() {
        return Err(Error::protocol(format!("inverted bucket rectangle {rect}")));
    }
    let bounds = descriptor.bounds();
    if !bounds.contains(&rect) {
        return Err(Error::bucket_out_of_bounds(rect, bounds));
    }

    let len = usize::try_from(rect.area())
        .ok()
        .and_then(|area| area.checked_mul(descriptor.pixel_size()))
        .ok_or_else(|| Error::resource(format!("bucket {rect} payload overflows")))?;

    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|e| Error::resource(format!("bucket payload of {len} bytes: {e}")))?;
    data.resize(len, 0);
    reader.read_exact(&mut data).await?;

    Ok(Bucket::new(rect, data))
}

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a complete `IMAGE_DATA` message.
///
/// `samples` are in wire channel order.
#[must_use]
pub fn encode_image_data(rect: Rect, samples: &[f32], order: PixelByteOrder) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMMAND_HEADER_LEN + RECT_LEN + samples.len() * 4);
    out.extend_from_slice(&Command::ImageData.header_bytes());
    out.extend_from_slice(&rect.encode());
    for sample in samples {
        let bytes = match order {
            PixelByteOrder::Little => sample.to_le_bytes(),
            PixelByteOrder::Big => sample.to_be_bytes(),
        };
        out.extend_from_slice(&bytes);
    }
    out
}

/// Encodes an `IMAGE_END` message.
#[inline]
#[must_use]
pub const fn encode_image_end() -> [u8; COMMAND_HEADER_LEN] {
    Command::ImageEnd.header_bytes()
}

// ============================================================================
// Tests
// ============================================================================
