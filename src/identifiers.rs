//! Type-safe identifiers.
//!
//! Newtype wrappers keep session ids and sink-issued frame handles from
//! being mixed up at compile time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ============================================================================
// SessionId
// ============================================================================

/// Counter backing [`SessionId::next`].
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one renderer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(NonZeroU64);

impl SessionId {
    /// Allocates the next session ID.
    #[must_use]
    pub fn next() -> Self {
        let raw = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need 2^64 sessions to wrap.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Creates a session ID from a raw value. Returns `None` for zero.
    #[inline]
    #[must_use]
    pub fn from_u64(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

// ============================================================================
// FrameHandle
// ============================================================================

/// Display target handle issued by a [`DisplaySink`](crate::DisplaySink).
///
/// The server treats the value as opaque and only hands it back to the
/// sink that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FrameHandle(u64);

impl FrameHandle {
    /// Wraps a sink-defined value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the sink-defined value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_session_id_zero_rejected() {
        assert!(SessionId::from_u64(0).is_none());
        assert_eq!(SessionId::from_u64(7).map(SessionId::as_u64), Some(7));
    }

    #[test]
    fn test_display_formats() {
        let id = SessionId::from_u64(3).unwrap();
        assert_eq!(id.to_string(), "S3");
        assert_eq!(FrameHandle::new(9).to_string(), "F9");
    }
}
