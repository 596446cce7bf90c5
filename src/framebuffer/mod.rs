//! Framebuffer assembly.
//!
//! Buckets arrive bottom-up with the extra channel first; the framebuffer
//! is stored top-down in `[R, G, B, A]` order.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `assembler` | [`BufferAssembler`]: synchronized bucket writes |
//! | `bucket` | [`Bucket`]: one decoded tile |
//! | `layout` | [`ChannelLayout`]: wire-to-storage channel reorder |

// ============================================================================
// Submodules
// ============================================================================

/// Synchronized bucket writes.
pub mod assembler;

/// Decoded tiles.
pub mod bucket;

/// Channel reorder between wire and storage order.
pub mod layout;

// ============================================================================
// Re-exports
// ============================================================================

pub use assembler::BufferAssembler;
pub use bucket::Bucket;
pub use layout::ChannelLayout;

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};
use crate::protocol::{FramebufferDescriptor, Rect};

// ============================================================================
// Types
// ============================================================================

/// One storage pixel in `[R, G, B, A]` order.
pub type Rgba = [f32; 4];

/// Value every pixel holds before its bucket lands.
pub const CLEAR_PIXEL: Rgba = [0.0; 4];

// ============================================================================
// Framebuffer
// ============================================================================

/// Dense row-major RGBA image, row 0 at the top.
#[derive(Debug, Clone, PartialEq)]
pub struct Framebuffer {
    /// Pixel bounds from the handshake.
    bounds: Rect,
    /// Pixels per row.
    width: usize,
    /// Rows.
    height: usize,
    /// `width * height` pixels.
    pixels: Vec<Rgba>,
}

impl Framebuffer {
    /// Allocates a cleared framebuffer for `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resource`] if the allocation is refused.
    pub fn allocate(descriptor: &FramebufferDescriptor) -> Result<Self> {
        let bounds = descriptor.bounds();
        let (width, height) = match (
            usize::try_from(bounds.width()),
            usize::try_from(bounds.height()),
        ) {
            (Ok(w), Ok(h)) => (w, h),
            _ => return Err(Error::resource(format!("framebuffer {bounds} too large"))),
        };
        let len = width
            .checked_mul(height)
            .ok_or_else(|| Error::resource(format!("framebuffer {bounds} too large")))?;

        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|e| Error::resource(format!("framebuffer of {len} pixels: {e}")))?;
        pixels.resize(len, CLEAR_PIXEL);

        Ok(Self {
            bounds,
            width,
            height,
            pixels,
        })
    }

    /// Returns the pixel bounds.
    #[inline]
    #[must_use]
    pub const fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Returns pixels per row.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Returns the row count.
    #[inline]
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Returns all pixels, top row first.
    #[inline]
    #[must_use]
    pub fn pixels(&self) -> &[Rgba] {
        &self.pixels
    }

    /// Returns the pixel at storage position (`col`, `row`), row 0 at the top.
    #[inline]
    #[must_use]
    pub fn pixel(&self, col: usize, row: usize) -> Option<Rgba> {
        if col >= self.width || row >= self.height {
            return None;
        }
        self.pixels.get(row * self.width + col).copied()
    }

    /// Returns storage row `row` as a slice.
    #[inline]
    #[must_use]
    pub fn row(&self, row: usize) -> Option<&[Rgba]> {
        let start = row.checked_mul(self.width)?;
        self.pixels.get(start..start + self.width)
    }

    /// Mutable storage row.
    #[inline]
    pub(crate) fn row_mut(&mut self, row: usize) -> Option<&mut [Rgba]> {
        let start = row.checked_mul(self.width)?;
        self.pixels.get_mut(start..start + self.width)
    }

    /// Consumes the framebuffer, returning its pixels.
    #[inline]
    #[must_use]
    pub fn into_pixels(self) -> Vec<Rgba> {
        self.pixels
    }
}

// ============================================================================
// Tests
// ============================================================================
