//! Error types for the display-driver server.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use dspy_server::{DisplayServer, Result, ServerConfig};
//!
//! async fn example(sink: std::sync::Arc<dyn dspy_server::DisplaySink>) -> Result<()> {
//!     let server = DisplayServer::new(ServerConfig::new(), sink)?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! Every session-level error is fatal to its own session only; the server
//! and sibling sessions keep running.
//!
//! | Category | Variants |
//! |----------|----------|
//! | Protocol | [`Error::Protocol`], [`Error::UnknownCommand`], [`Error::BucketOutOfBounds`] |
//! | Resource | [`Error::Resource`], [`Error::QueueFull`] |
//! | Transport | [`Error::Io`], [`Error::ConnectionClosed`], [`Error::IdleTimeout`] |
//! | Worker | [`Error::PayloadLength`], [`Error::Worker`] |
//! | Lifecycle | [`Error::Config`], [`Error::Json`], [`Error::Cancelled`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::{Error as IoError, ErrorKind};
use std::result::Result as StdResult;

use thiserror::Error;

use crate::protocol::Rect;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when server configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed handshake or message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Command byte outside the known set.
    #[error("Unknown command: {code}")]
    UnknownCommand {
        /// The unrecognized command code.
        code: u8,
    },

    /// Bucket rectangle not contained in the framebuffer.
    #[error("Bucket {bucket} outside framebuffer bounds {bounds}")]
    BucketOutOfBounds {
        /// Rectangle declared by the bucket.
        bucket: Rect,
        /// Framebuffer bounds negotiated at handshake.
        bounds: Rect,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// Framebuffer or payload allocation refused.
    #[error("Resource error: {message}")]
    Resource {
        /// Description of the resource failure.
        message: String,
    },

    /// Bucket could not be admitted to the worker queue in time.
    #[error("Bucket queue full ({limit} pending) after {timeout_ms}ms")]
    QueueFull {
        /// Pending bucket limit of the session.
        limit: usize,
        /// Milliseconds waited for a free slot.
        timeout_ms: u64,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Peer closed the connection mid-message.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No data arrived within the idle timeout.
    #[error("Idle timeout after {timeout_ms}ms")]
    IdleTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Handshake did not complete in time.
    #[error("Handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Milliseconds allowed for the handshake.
        timeout_ms: u64,
    },

    // ========================================================================
    // Worker Errors
    // ========================================================================
    /// Bucket payload does not match its declared rectangle.
    #[error("Payload length mismatch: expected {expected} bytes, got {actual}")]
    PayloadLength {
        /// Bytes implied by rectangle and pixel size.
        expected: usize,
        /// Bytes actually carried.
        actual: usize,
    },

    /// Bucket task failed to run to completion.
    #[error("Worker failure: {message}")]
    Worker {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Session cancelled by server shutdown.
    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(IoError),

    /// JSON configuration error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Conversions
// ============================================================================

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        // A short read is the peer hanging up mid-message.
        if err.kind() == ErrorKind::UnexpectedEof {
            Self::ConnectionClosed
        } else {
            Self::Io(err)
        }
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an unknown command error.
    #[inline]
    pub fn unknown_command(code: u8) -> Self {
        Self::UnknownCommand { code }
    }

    /// Creates an out-of-bounds bucket error.
    #[inline]
    pub fn bucket_out_of_bounds(bucket: Rect, bounds: Rect) -> Self {
        Self::BucketOutOfBounds { bucket, bounds }
    }

    /// Creates a resource error.
    #[inline]
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    /// Creates a queue full error.
    #[inline]
    pub fn queue_full(limit: usize, timeout_ms: u64) -> Self {
        Self::QueueFull { limit, timeout_ms }
    }

    /// Creates an idle timeout error.
    #[inline]
    pub fn idle_timeout(timeout_ms: u64) -> Self {
        Self::IdleTimeout { timeout_ms }
    }

    /// Creates a handshake timeout error.
    #[inline]
    pub fn handshake_timeout(timeout_ms: u64) -> Self {
        Self::HandshakeTimeout { timeout_ms }
    }

    /// Creates a payload length error.
    #[inline]
    pub fn payload_length(expected: usize, actual: usize) -> Self {
        Self::PayloadLength { expected, actual }
    }

    /// Creates a worker failure.
    #[inline]
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a protocol error.
    ///
    /// Transport failures count as protocol errors: a stream that ends
    /// mid-bucket is indistinguishable from a malformed one.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::UnknownCommand { .. }
                | Self::BucketOutOfBounds { .. }
                | Self::ConnectionClosed
                | Self::IdleTimeout { .. }
                | Self::HandshakeTimeout { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if this is a resource error.
    #[inline]
    #[must_use]
    pub fn is_resource_error(&self) -> bool {
        matches!(self, Self::Resource { .. } | Self::QueueFull { .. })
    }

    /// Returns `true` if a bucket task failed.
    #[inline]
    #[must_use]
    pub fn is_worker_failure(&self) -> bool {
        matches!(self, Self::PayloadLength { .. } | Self::Worker { .. })
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::IdleTimeout { .. } | Self::HandshakeTimeout { .. } | Self::QueueFull { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::protocol("bad handshake");
        assert_eq!(err.to_string(), "Protocol error: bad handshake");
    }

    #[test]
    fn test_unknown_command_display() {
        let err = Error::unknown_command(42);
        assert_eq!(err.to_string(), "Unknown command: 42");
    }

    #[test]
    fn test_out_of_bounds_display() {
        let err = Error::bucket_out_of_bounds(Rect::new(0, 64, 0, 15), Rect::new(0, 63, 0, 63));
        assert_eq!(
            err.to_string(),
            "Bucket [0..=64]x[0..=15] outside framebuffer bounds [0..=63]x[0..=63]"
        );
    }

    #[test]
    fn test_is_protocol_error() {
        assert!(Error::protocol("x").is_protocol_error());
        assert!(Error::unknown_command(1).is_protocol_error());
        assert!(Error::ConnectionClosed.is_protocol_error());
        assert!(Error::idle_timeout(10).is_protocol_error());
        assert!(!Error::resource("x").is_protocol_error());
        assert!(!Error::worker("x").is_protocol_error());
    }

    #[test]
    fn test_handshake_timeout_distinct_from_idle() {
        let err = Error::handshake_timeout(30_000);
        assert_eq!(err.to_string(), "Handshake timed out after 30000ms");
        assert!(err.is_timeout());
        assert!(err.is_protocol_error());
        assert!(!matches!(err, Error::IdleTimeout { .. }));
    }

    #[test]
    fn test_is_worker_failure() {
        assert!(Error::payload_length(16, 12).is_worker_failure());
        assert!(Error::worker("panic").is_worker_failure());
        assert!(!Error::Cancelled.is_worker_failure());
    }

    #[test]
    fn test_is_resource_error() {
        assert!(Error::queue_full(8, 100).is_resource_error());
        assert!(Error::resource("alloc").is_resource_error());
        assert!(!Error::config("x").is_resource_error());
    }

    #[test]
    fn test_from_unexpected_eof() {
        let io_err = IoError::new(ErrorKind::UnexpectedEof, "early eof");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn test_from_other_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionReset, "reset");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
