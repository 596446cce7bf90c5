//! Decoded tiles.

// ============================================================================
// Imports
// ============================================================================

use crate::protocol::Rect;

// ============================================================================
// Bucket
// ============================================================================

/// One rectangular tile of raw pixel samples.
///
/// `data` holds row-major, channel-interleaved float32 samples in wire
/// order, bottom row first. Nothing guarantees the length matches the
/// rectangle until [`BufferAssembler::apply_bucket`] checks it.
///
/// [`BufferAssembler::apply_bucket`]: super::BufferAssembler::apply_bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    rect: Rect,
    data: Vec<u8>,
}

impl Bucket {
    /// Creates a bucket.
    #[inline]
    #[must_use]
    pub fn new(rect: Rect, data: Vec<u8>) -> Self {
        Self { rect, data }
    }

    /// Returns the target rectangle.
    #[inline]
    #[must_use]
    pub const fn rect(&self) -> Rect {
        self.rect
    }

    /// Returns the raw samples.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the bytes the rectangle implies for `pixel_size`, or `None`
    /// on overflow.
    #[inline]
    #[must_use]
    pub fn expected_len(&self, pixel_size: usize) -> Option<usize> {
        usize::try_from(self.rect.area())
            .ok()?
            .checked_mul(pixel_size)
    }
}
