//! Display server - Framebuffer assembly for bucket-streaming renderers.
//!
//! This library implements the server side of a display-driver protocol:
//! a renderer connects over TCP, describes its framebuffer, then streams
//! rectangular tiles ("buckets") of float32 pixels in any order. The server
//! assembles them into an RGBA image and hands it to an injected
//! [`DisplaySink`].
//!
//! # Architecture
//!
//! The server follows a session-per-connection model:
//!
//! - **Acceptor**: One task owns the listener and the session registry
//! - **Session**: One task per renderer reads commands in receipt order
//! - **Workers**: A bounded pool decodes buckets and writes the framebuffer
//!
//! Key design principles:
//!
//! - Each session owns its framebuffer; nothing is shared across sessions
//! - Buckets cover disjoint rectangles, so completion order is immaterial
//! - The read loop never waits for pixel math, only for admission
//! - `end_frame` is called exactly once for every begun frame
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dspy_server::{DisplayServer, NullSink, Result, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServerConfig::new().with_port(12345).with_workers(4);
//!     let server = DisplayServer::new(config, Arc::new(NullSink::new()))?;
//!
//!     let addr = server.start().await?;
//!     println!("Waiting for renderers on {addr}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | [`ServerConfig`] and policies |
//! | [`display`] | [`DisplaySink`] trait |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`framebuffer`] | [`Framebuffer`], channel reorder, bucket assembly |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire format encode/decode |
//! | [`transport`] | TCP acceptor, sessions and worker pool |

// ============================================================================
// Modules
// ============================================================================

/// Server configuration.
///
/// Build with [`ServerConfig::new()`] and the `with_*` methods, or load
/// from JSON with [`ServerConfig::from_json`].
pub mod config;

/// Display sink interface.
pub mod display;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Framebuffer storage and bucket assembly.
pub mod framebuffer;

/// Type-safe identifiers.
pub mod identifiers;

/// Display-driver wire protocol.
pub mod protocol;

/// TCP transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{PartialFramePolicy, PixelByteOrder, ServerConfig, ShutdownPolicy};

// Display
pub use display::{DisplaySink, NullSink};

// Error types
pub use error::{Error, Result};

// Framebuffer types
pub use framebuffer::{Bucket, BufferAssembler, ChannelLayout, Framebuffer, Rgba};

// Identifier types
pub use identifiers::{FrameHandle, SessionId};

// Protocol types
pub use protocol::{Command, FramebufferDescriptor, HandshakeRequest, Rect};

// Transport types
pub use transport::{DisplayServer, IdleHook, SessionReport, SessionState};
