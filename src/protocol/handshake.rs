//! Handshake request and framebuffer descriptor.
//!
//! The renderer opens the session with three `;`-separated fields:
//!
//! ```text
//! ┌─────┬────────────┬───┬─────┬─────────┬───┬─────┬──────────────────────┐
//! │ tag │ image name │ ; │ tag │ ignored │ ; │ tag │ descriptor (33 bytes)│
//! └─────┴────────────┴───┴─────┴─────────┴───┴─────┴──────────────────────┘
//! ```
//!
//! The descriptor is eight big-endian `u32` values followed by one merge
//! byte:
//!
//! ```text
//! xmin xmax ymin ymax alpha_bits z_bits channel_bits num_channels merge
//! ```
//!
//! The server answers with a single `u32` zero once the framebuffer is
//! allocated.

// ============================================================================
// Imports
// ============================================================================

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

use super::{Rect, SAMPLE_LEN};

// ============================================================================
// Constants
// ============================================================================

/// Separator between handshake fields.
pub const FIELD_SEPARATOR: u8 = b';';

/// Tag byte the encoder writes in front of every field.
pub const FIELD_TAG: u8 = 0;

/// Longest text field accepted, separator included.
pub const MAX_TEXT_FIELD_LEN: usize = 1024;

/// Bytes of the encoded descriptor, without its tag.
pub const DESCRIPTOR_LEN: usize = 8 * 4 + 1;

/// Most channels a pixel may carry.
pub const MAX_CHANNELS: u32 = 64;

/// Handshake response meaning "ready".
pub const READY_RESPONSE: [u8; 4] = 0u32.to_be_bytes();

// ============================================================================
// FramebufferDescriptor
// ============================================================================

/// Framebuffer bounds and channel layout negotiated at handshake.
///
/// Bounds are inclusive pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDescriptor {
    /// Leftmost column.
    pub xmin: u32,
    /// Rightmost column.
    pub xmax: u32,
    /// First row.
    pub ymin: u32,
    /// Last row.
    pub ymax: u32,
    /// Declared alpha bit depth (0 = no alpha channel).
    pub alpha_bits: u32,
    /// Declared depth bit depth (0 = no depth channel).
    pub z_bits: u32,
    /// Declared color channel bit depth.
    pub channel_bits: u32,
    /// Number of color channels.
    pub num_channels: u32,
    /// Merge flag forwarded by the renderer.
    pub merge: bool,
}

impl FramebufferDescriptor {
    /// Creates an RGBA descriptor covering `[xmin, xmax] x [ymin, ymax]`.
    #[must_use]
    pub const fn rgba(xmin: u32, xmax: u32, ymin: u32, ymax: u32) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
            alpha_bits: 32,
            z_bits: 0,
            channel_bits: 32,
            num_channels: 3,
            merge: false,
        }
    }

    /// Decodes the 33-byte descriptor field.
    #[must_use]
    pub fn decode(bytes: &[u8; DESCRIPTOR_LEN]) -> Self {
        let word = |i: usize| {
            u32::from_be_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };

        Self {
            xmin: word(0),
            xmax: word(1),
            ymin: word(2),
            ymax: word(3),
            alpha_bits: word(4),
            z_bits: word(5),
            channel_bits: word(6),
            num_channels: word(7),
            merge: bytes[32] != 0,
        }
    }

    /// Encodes the 33-byte descriptor field.
    #[must_use]
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut out = [0u8; DESCRIPTOR_LEN];
        let words = [
            self.xmin,
            self.xmax,
            self.ymin,
            self.ymax,
            self.alpha_bits,
            self.z_bits,
            self.channel_bits,
            self.num_channels,
        ];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out[32] = u8::from(self.merge);
        out
    }

    /// Returns the framebuffer bounds.
    #[inline]
    #[must_use]
    pub const fn bounds(&self) -> Rect {
        Rect::new(self.xmin, self.xmax, self.ymin, self.ymax)
    }

    /// Returns `true` if an alpha or depth channel precedes the colors.
    #[inline]
    #[must_use]
    pub const fn has_extra_channel(&self) -> bool {
        self.alpha_bits > 0 || self.z_bits > 0
    }

    /// Returns the channels per pixel: colors plus one slot each for
    /// alpha and depth when declared.
    #[inline]
    #[must_use]
    pub const fn channel_count(&self) -> usize {
        self.num_channels as usize + (self.alpha_bits > 0) as usize + (self.z_bits > 0) as usize
    }

    /// Returns bytes per pixel.
    ///
    /// Every channel travels as a float32 regardless of the declared bit
    /// depth, so this is always `channel_count * 4`.
    #[inline]
    #[must_use]
    pub const fn pixel_size(&self) -> usize {
        self.channel_count() * SAMPLE_LEN
    }

    /// Returns the framebuffer width in pixels.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> u64 {
        self.bounds().width()
    }

    /// Returns the framebuffer height in pixels.
    #[inline]
    #[must_use]
    pub const fn height(&self) -> u64 {
        self.bounds().height()
    }

    /// Returns the framebuffer pixel count.
    #[inline]
    #[must_use]
    pub const fn pixel_count(&self) -> u64 {
        self.width().saturating_mul(self.height())
    }

    /// Validates bounds and channel layout.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if bounds are inverted or no color channel is declared
    /// - [`Error::Resource`] if the framebuffer would exceed `max_pixels` or
    ///   a side does not fit in `u32`
    pub fn validate(&self, max_pixels: u64) -> Result<()> {
        if !self.bounds().is_well_formed() {
            return Err(Error::protocol(format!(
                "inverted framebuffer bounds {}",
                self.bounds()
            )));
        }
        if self.num_channels == 0 || self.num_channels > MAX_CHANNELS {
            return Err(Error::protocol(format!(
                "unsupported color channel count {}",
                self.num_channels
            )));
        }
        if self.width() > u64::from(u32::MAX) || self.height() > u64::from(u32::MAX) {
            return Err(Error::resource(format!(
                "framebuffer of {}x{} exceeds the sink's coordinate range",
                self.width(),
                self.height()
            )));
        }
        if self.pixel_count() > max_pixels {
            return Err(Error::resource(format!(
                "framebuffer of {} pixels exceeds limit of {max_pixels}",
                self.pixel_count()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// HandshakeRequest
// ============================================================================

/// Decoded handshake request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Image name announced by the renderer.
    pub image_name: String,
    /// Negotiated framebuffer layout.
    pub descriptor: FramebufferDescriptor,
}

impl HandshakeRequest {
    /// Creates a handshake request.
    #[inline]
    #[must_use]
    pub fn new(image_name: impl Into<String>, descriptor: FramebufferDescriptor) -> Self {
        Self {
            image_name: image_name.into(),
            descriptor,
        }
    }

    /// Encodes the request the way a renderer sends it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the name contains the field separator
    /// or does not fit in a text field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.image_name.as_bytes();
        if name.contains(&FIELD_SEPARATOR) || name.len() + 2 > MAX_TEXT_FIELD_LEN {
            return Err(Error::protocol(format!(
                "image name cannot be encoded: {:?}",
                self.image_name
            )));
        }

        let mut out = Vec::with_capacity(name.len() + 5 + DESCRIPTOR_LEN);
        out.push(FIELD_TAG);
        out.extend_from_slice(name);
        out.push(FIELD_SEPARATOR);
        out.push(FIELD_TAG);
        out.push(FIELD_SEPARATOR);
        out.push(FIELD_TAG);
        out.extend_from_slice(&self.descriptor.encode());
        Ok(out)
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Reads one handshake request.
///
/// The descriptor field has a fixed length and is read exactly, so binary
/// descriptor bytes equal to the separator are harmless.
///
/// # Errors
///
/// - [`Error::ConnectionClosed`] if the stream ends early
/// - [`Error::Protocol`] if a text field exceeds [`MAX_TEXT_FIELD_LEN`]
pub async fn read_handshake<R>(reader: &mut R) -> Result<HandshakeRequest>
where
    R: AsyncBufRead + Unpin,
{
    let name_field = read_text_field(reader).await?;
    // Middle field carries nothing the server uses.
    read_text_field(reader).await?;

    let mut field = [0u8; DESCRIPTOR_LEN + 1];
    reader.read_exact(&mut field).await?;

    let mut descriptor = [0u8; DESCRIPTOR_LEN];
    descriptor.copy_from_slice(&field[1..]);

    let image_name = String::from_utf8_lossy(name_field.get(1..).unwrap_or_default()).into_owned();

    Ok(HandshakeRequest {
        image_name,
        descriptor: FramebufferDescriptor::decode(&descriptor),
    })
}

/// Reads a `;`-terminated field and strips the separator.
async fn read_text_field<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut field = Vec::new();
    let limit = MAX_TEXT_FIELD_LEN as u64;
    let read = (&mut *reader)
        .take(limit)
        .read_until(FIELD_SEPARATOR, &mut field)
        .await?;

    if field.last() != Some(&FIELD_SEPARATOR) {
        return if read as u64 >= limit {
            Err(Error::protocol(format!(
                "handshake field exceeds {MAX_TEXT_FIELD_LEN} bytes"
            )))
        } else {
            Err(Error::ConnectionClosed)
        };
    }

    field.pop();
    Ok(field)
}

// ============================================================================
// Tests
// ============================================================================
