//! Channel reorder between wire and storage order.
//!
//! When the descriptor declares alpha or depth, wire slot 0 carries that
//! extra channel and the colors follow. Storage order is always
//! `[R, G, B, A]`, so the common four-channel case is the reorder
//! `[1, 2, 3, 0]`:
//!
//! ```text
//! wire:    [ A  R  G  B ]
//!             \  \  \  \
//! storage: [ R  G  B  A ]
//! ```
//!
//! Without an extra channel alpha is stored as 1.0. A single color channel
//! is replicated to grey. Slots past the ones mapped above are skipped.

// ============================================================================
// Imports
// ============================================================================

use crate::config::PixelByteOrder;
use crate::protocol::{FramebufferDescriptor, SAMPLE_LEN};

use super::Rgba;

// ============================================================================
// Constants
// ============================================================================

/// Alpha stored when the wire carries none.
pub const OPAQUE: f32 = 1.0;

// ============================================================================
// ChannelLayout
// ============================================================================

/// Mapping from wire sample slots to storage channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Samples per pixel on the wire.
    channels: usize,
    /// Wire slot stored as alpha.
    alpha: Option<usize>,
    /// Wire slots stored as R, G, B.
    color: [usize; 3],
    /// Byte order of each sample.
    order: PixelByteOrder,
}

impl ChannelLayout {
    /// Derives the layout from a validated descriptor.
    #[must_use]
    pub fn new(descriptor: &FramebufferDescriptor, order: PixelByteOrder) -> Self {
        let first_color = usize::from(descriptor.has_extra_channel());
        let alpha = descriptor.has_extra_channel().then_some(0);
        let color = if descriptor.num_channels >= 3 {
            [first_color, first_color + 1, first_color + 2]
        } else {
            [first_color; 3]
        };

        Self {
            channels: descriptor.channel_count(),
            alpha,
            color,
            order,
        }
    }

    /// Returns samples per pixel.
    #[inline]
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Returns bytes per pixel.
    #[inline]
    #[must_use]
    pub const fn pixel_size(&self) -> usize {
        self.channels * SAMPLE_LEN
    }

    /// Converts one wire pixel to storage order.
    ///
    /// `pixel` must be exactly [`pixel_size`](Self::pixel_size) bytes.
    #[inline]
    #[must_use]
    pub fn to_rgba(&self, pixel: &[u8]) -> Rgba {
        let alpha = match self.alpha {
            Some(slot) => self.sample(pixel, slot),
            None => OPAQUE,
        };
        [
            self.sample(pixel, self.color[0]),
            self.sample(pixel, self.color[1]),
            self.sample(pixel, self.color[2]),
            alpha,
        ]
    }

    /// Converts one storage pixel to wire bytes; slots the layout does not
    /// map are zero.
    #[must_use]
    pub fn encode(&self, rgba: Rgba) -> Vec<u8> {
        let mut samples = vec![0.0f32; self.channels];
        // Written in reverse so replicated grey ends up with the red value.
        for (slot, value) in self.color.iter().zip(&rgba[..3]).rev() {
            samples[*slot] = *value;
        }
        if let Some(slot) = self.alpha {
            samples[slot] = rgba[3];
        }

        let mut out = Vec::with_capacity(self.pixel_size());
        for sample in samples {
            out.extend_from_slice(&self.sample_bytes(sample));
        }
        out
    }

    /// Reads the float in wire slot `slot`.
    #[inline]
    fn sample(&self, pixel: &[u8], slot: usize) -> f32 {
        let at = slot * SAMPLE_LEN;
        let bytes = [pixel[at], pixel[at + 1], pixel[at + 2], pixel[at + 3]];
        match self.order {
            PixelByteOrder::Little => f32::from_le_bytes(bytes),
            PixelByteOrder::Big => f32::from_be_bytes(bytes),
        }
    }

    #[inline]
    fn sample_bytes(&self, value: f32) -> [u8; SAMPLE_LEN] {
        match self.order {
            PixelByteOrder::Little => value.to_le_bytes(),
            PixelByteOrder::Big => value.to_be_bytes(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
