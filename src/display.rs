//! Display sink interface.
//!
//! The server never decides where pixels end up. Each session drives an
//! injected [`DisplaySink`] through one frame:
//!
//! ```text
//! begin_frame ──► update_frame* ──► end_frame
//! (handshake)     (progress,         (always, once)
//!                  final hand-off)
//! ```
//!
//! Calls run on the session task, so implementations should return
//! promptly and copy what they need out of the pixel slice.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use crate::framebuffer::Rgba;
use crate::identifiers::FrameHandle;

// ============================================================================
// DisplaySink
// ============================================================================

/// Consumer of partial and final framebuffers, implemented by the host.
pub trait DisplaySink: Send + Sync {
    /// Allocates a display target for a `width` x `height` image whose top
    /// left corner sits at (`x0`, `y0`).
    fn begin_frame(&self, x0: u32, y0: u32, width: u32, height: u32) -> FrameHandle;

    /// Pushes the framebuffer, top row first, `[R, G, B, A]` per pixel.
    fn update_frame(&self, handle: FrameHandle, pixels: &[Rgba]);

    /// Finalizes the display target. Called exactly once per
    /// [`begin_frame`](Self::begin_frame).
    fn end_frame(&self, handle: FrameHandle);
}

// ============================================================================
// NullSink
// ============================================================================

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink {
    next: AtomicU64,
}

impl NullSink {
    /// Creates a null sink.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisplaySink for NullSink {
    fn begin_frame(&self, _x0: u32, _y0: u32, _width: u32, _height: u32) -> FrameHandle {
        FrameHandle::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn update_frame(&self, _handle: FrameHandle, _pixels: &[Rgba]) {}

    fn end_frame(&self, _handle: FrameHandle) {}
}

// ============================================================================
// Tests
// ============================================================================
