//! Display-driver wire protocol.
//!
//! This module defines the binary messages exchanged between the renderer
//! (client) and the display server.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Layout |
//! |---------|-----------|--------|
//! | Handshake request | Renderer → Server | `name ; ignored ; descriptor` |
//! | Handshake response | Server → Renderer | `u32` zero ("ready") |
//! | `IMAGE_DATA` | Renderer → Server | header, 4×`u32` rectangle, float32 pixels |
//! | `IMAGE_END` | Renderer → Server | header only |
//!
//! Header integers are big-endian. Every command starts with a two-byte
//! header: command code followed by one reserved byte.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `handshake` | Handshake request, [`FramebufferDescriptor`], ready response |
//! | `command` | Command header, [`Rect`], `IMAGE_DATA` payload |

// ============================================================================
// Submodules
// ============================================================================

/// Command header and bucket messages.
pub mod command;

/// Handshake request and framebuffer descriptor.
pub mod handshake;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{
    Command, Rect, encode_image_data, encode_image_end, read_command, read_image_data,
};
pub use handshake::{FramebufferDescriptor, HandshakeRequest, READY_RESPONSE, read_handshake};

// ============================================================================
// Constants
// ============================================================================

/// Command code of a bucket message.
pub const IMAGE_DATA: u8 = 104;

/// Command code terminating the stream.
pub const IMAGE_END: u8 = 105;

/// Bytes in a command header (code + reserved).
pub const COMMAND_HEADER_LEN: usize = 2;

/// Bytes in an `IMAGE_DATA` rectangle.
pub const RECT_LEN: usize = 16;

/// Bytes per pixel sample. Samples are float32 whatever bit depth the
/// descriptor declares.
pub const SAMPLE_LEN: usize = 4;
