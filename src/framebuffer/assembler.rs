//! Synchronized bucket writes.
//!
//! The assembler owns one session's [`Framebuffer`] behind a single mutex.
//! Decoding and channel reorder run before the lock is taken; only the row
//! copies happen under it. Concurrent buckets are correct because they
//! cover disjoint rectangles, so completion order never changes the result.
//!
//! # Orientation
//!
//! The wire is bottom-up (row 0 is the image bottom); storage is top-down.
//! The flip is applied here, once per write:
//!
//! ```text
//! storage_row = height - 1 - (y - ymin)
//! ```
//!
//! Hand-off buffers are therefore already top-down.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use tracing::trace;

use crate::config::PixelByteOrder;
use crate::error::{Error, Result};
use crate::protocol::{FramebufferDescriptor, Rect};

use super::{Bucket, ChannelLayout, Framebuffer, Rgba};

// ============================================================================
// BufferAssembler
// ============================================================================

/// Writes decoded buckets into a session framebuffer.
#[derive(Debug)]
pub struct BufferAssembler {
    /// Negotiated layout.
    descriptor: FramebufferDescriptor,
    /// Wire-to-storage reorder.
    layout: ChannelLayout,
    /// The framebuffer, guarded as a whole.
    frame: Mutex<Framebuffer>,
}

impl BufferAssembler {
    /// Validates `descriptor` and allocates its framebuffer.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the descriptor is malformed
    /// - [`Error::Resource`] if the framebuffer exceeds `max_pixels` or
    ///   cannot be allocated
    pub fn new(
        descriptor: FramebufferDescriptor,
        order: PixelByteOrder,
        max_pixels: u64,
    ) -> Result<Self> {
        descriptor.validate(max_pixels)?;
        let frame = Framebuffer::allocate(&descriptor)?;

        Ok(Self {
            layout: ChannelLayout::new(&descriptor, order),
            descriptor,
            frame: Mutex::new(frame),
        })
    }

    /// Returns the negotiated descriptor.
    #[inline]
    #[must_use]
    pub const fn descriptor(&self) -> &FramebufferDescriptor {
        &self.descriptor
    }

    /// Returns the channel layout.
    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Writes one bucket.
    ///
    /// The framebuffer is untouched when an error is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::BucketOutOfBounds`] if the rectangle leaves the framebuffer
    /// - [`Error::PayloadLength`] if the samples do not fill the rectangle exactly
    pub fn apply_bucket(&self, bucket: &Bucket) -> Result<()> {
        let rect = bucket.rect();
        let bounds = self.descriptor.bounds();
        if !bounds.contains(&rect) {
            return Err(Error::bucket_out_of_bounds(rect, bounds));
        }

        let pixel_size = self.layout.pixel_size();
        let expected = bucket
            .expected_len(pixel_size)
            .ok_or_else(|| Error::resource(format!("bucket {rect} payload overflows")))?;
        if bucket.data().len() != expected {
            return Err(Error::payload_length(expected, bucket.data().len()));
        }

        let pixels: Vec<Rgba> = bucket
            .data()
            .chunks_exact(pixel_size)
            .map(|px| self.layout.to_rgba(px))
            .collect();

        self.write_rows(rect, &pixels);
        trace!(%rect, "Bucket applied");
        Ok(())
    }

    /// Copies already-reordered rows into place, flipping vertically.
    fn write_rows(&self, rect: Rect, pixels: &[Rgba]) {
        let bounds = self.descriptor.bounds();
        let width = rect.width() as usize;
        let col = (rect.xmin - bounds.xmin) as usize;
        let first_row = (rect.ymin - bounds.ymin) as usize;

        let mut frame = self.frame.lock();
        let last_row = frame.height() - 1;
        for (i, src) in pixels.chunks_exact(width).enumerate() {
            let row = last_row - (first_row + i);
            if let Some(dst) = frame.row_mut(row) {
                dst[col..col + width].copy_from_slice(src);
            }
        }
    }

    /// Returns a copy of the current pixels, top row first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Rgba> {
        self.frame.lock().pixels().to_vec()
    }

    /// Runs `f` on the framebuffer while holding the lock.
    pub fn with_frame<T>(&self, f: impl FnOnce(&Framebuffer) -> T) -> T {
        f(&self.frame.lock())
    }

    /// Consumes the assembler, returning the framebuffer.
    #[must_use]
    pub fn into_framebuffer(self) -> Framebuffer {
        self.frame.into_inner()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::framebuffer::CLEAR_PIXEL;

    fn assembler(xmax: u32, ymax: u32) -> BufferAssembler {
        BufferAssembler::new(
            FramebufferDescriptor::rgba(0, xmax, 0, ymax),
            PixelByteOrder::Little,
            u64::MAX,
        )
        .expect("assembler")
    }

    /// Bucket filled with one storage color.
    fn solid(layout: &ChannelLayout, rect: Rect, rgba: Rgba) -> Bucket {
        let pixel = layout.encode(rgba);
        let data = pixel.repeat(rect.area() as usize);
        Bucket::new(rect, data)
    }

    /// Bucket whose pixels encode their own wire coordinates.
    fn coordinates(layout: &ChannelLayout, rect: Rect) -> Bucket {
        let mut data = Vec::new();
        for y in rect.ymin..=rect.ymax {
            for x in rect.xmin..=rect.xmax {
                data.extend(layout.encode([x as f32, y as f32, 0.5, 1.0]));
            }
        }
        Bucket::new(rect, data)
    }

    #[test]
    fn test_scenario_two_halves_flip() {
        let asm = assembler(63, 63);
        let bottom = [1.0, 0.0, 0.0, 1.0];
        let top = [0.0, 0.0, 1.0, 0.5];

        asm.apply_bucket(&solid(asm.layout(), Rect::new(0, 63, 0, 31), bottom))
            .unwrap();
        asm.apply_bucket(&solid(asm.layout(), Rect::new(0, 63, 32, 63), top))
            .unwrap();

        let fb = asm.into_framebuffer();
        for row in 0..32 {
            assert!(fb.row(row).unwrap().iter().all(|p| *p == top), "row {row}");
        }
        for row in 32..64 {
            assert!(fb.row(row).unwrap().iter().all(|p| *p == bottom), "row {row}");
        }
    }

    #[test]
    fn test_flip_per_pixel() {
        let asm = assembler(3, 2);
        asm.apply_bucket(&coordinates(asm.layout(), Rect::new(0, 3, 0, 2)))
            .unwrap();

        asm.with_frame(|fb| {
            // Wire row 0 (image bottom) lands in the last storage row.
            assert_eq!(fb.pixel(1, 2), Some([1.0, 0.0, 0.5, 1.0]));
            assert_eq!(fb.pixel(3, 0), Some([3.0, 2.0, 0.5, 1.0]));
        });
    }

    #[test]
    fn test_offset_bounds() {
        let asm = BufferAssembler::new(
            FramebufferDescriptor::rgba(10, 13, 20, 21),
            PixelByteOrder::Little,
            u64::MAX,
        )
        .unwrap();
        asm.apply_bucket(&coordinates(asm.layout(), Rect::new(12, 13, 20, 20)))
            .unwrap();

        asm.with_frame(|fb| {
            assert_eq!(fb.pixel(2, 1), Some([12.0, 20.0, 0.5, 1.0]));
            assert_eq!(fb.pixel(3, 1), Some([13.0, 20.0, 0.5, 1.0]));
            assert_eq!(fb.pixel(0, 0), Some(CLEAR_PIXEL));
        });
    }

    #[test]
    fn test_flush_edge_accepted() {
        let asm = assembler(63, 63);
        let rect = Rect::new(48, 63, 48, 63);
        assert!(asm.apply_bucket(&solid(asm.layout(), rect, [1.0; 4])).is_ok());
        asm.with_frame(|fb| assert_eq!(fb.pixel(63, 0), Some([1.0; 4])));
    }

    #[test]
    fn test_out_of_bounds_leaves_frame_untouched() {
        let asm = assembler(63, 63);
        let rect = Rect::new(48, 64, 0, 15);
        let err = asm
            .apply_bucket(&solid(asm.layout(), rect, [1.0; 4]))
            .unwrap_err();

        assert!(matches!(err, Error::BucketOutOfBounds { .. }));
        assert!(asm.snapshot().iter().all(|p| *p == CLEAR_PIXEL));
    }

    #[test]
    fn test_payload_length_mismatch() {
        let asm = assembler(7, 7);
        let mut bucket = solid(asm.layout(), Rect::new(0, 1, 0, 1), [1.0; 4]);
        bucket = Bucket::new(bucket.rect(), bucket.data()[..60].to_vec());

        let err = asm.apply_bucket(&bucket).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadLength {
                expected: 64,
                actual: 60
            }
        ));
        assert!(asm.snapshot().iter().all(|p| *p == CLEAR_PIXEL));
    }

    #[test]
    fn test_invalid_descriptor_rejected() {
        let err = BufferAssembler::new(
            FramebufferDescriptor::rgba(0, 63, 0, 63),
            PixelByteOrder::Little,
            100,
        )
        .unwrap_err();
        assert!(err.is_resource_error());
    }

    #[test]
    fn test_concurrent_disjoint_writes() {
        let asm = Arc::new(assembler(63, 63));
        let handles: Vec<_> = (0..8u32)
            .map(|band| {
                let asm = Arc::clone(&asm);
                std::thread::spawn(move || {
                    let rect = Rect::new(0, 63, band * 8, band * 8 + 7);
                    let color = [band as f32, 0.0, 0.0, 1.0];
                    asm.apply_bucket(&solid(asm.layout(), rect, color))
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        asm.with_frame(|fb| {
            for row in 0..64 {
                let band = ((63 - row) / 8) as f32;
                assert!(fb.row(row).unwrap().iter().all(|p| p[0] == band));
            }
        });
    }

    /// 4x4 tiling of a 16x16 framebuffer.
    fn tiles() -> Vec<Rect> {
        let mut rects = Vec::new();
        for ty in 0..4 {
            for tx in 0..4 {
                rects.push(Rect::new(tx * 4, tx * 4 + 3, ty * 4, ty * 4 + 3));
            }
        }
        rects
    }

    proptest! {
        #[test]
        fn prop_order_independent(order in Just((0..16usize).collect::<Vec<_>>()).prop_shuffle()) {
            let reference = assembler(15, 15);
            for rect in tiles() {
                reference.apply_bucket(&coordinates(reference.layout(), rect)).unwrap();
            }

            let shuffled = assembler(15, 15);
            let rects = tiles();
            for i in order {
                shuffled.apply_bucket(&coordinates(shuffled.layout(), rects[i])).unwrap();
            }

            let a: Vec<[u32; 4]> = reference.snapshot().iter().map(|p| p.map(f32::to_bits)).collect();
            let b: Vec<[u32; 4]> = shuffled.snapshot().iter().map(|p| p.map(f32::to_bits)).collect();
            prop_assert_eq!(a, b);
            prop_assert!(shuffled.snapshot().iter().all(|p| p[3] == 1.0));
        }
    }
}
