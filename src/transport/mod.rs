//! TCP transport layer.
//!
//! This module accepts renderer connections and runs one session per
//! connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Renderer       │                              │  DisplayServer  │
//! │                 │            TCP               │                 │
//! │  handshake      │─────────────────────────────►│  → Session      │
//! │  IMAGE_DATA*    │      host:PORT               │  → WorkerPool   │
//! │  IMAGE_END      │◄──── ready (u32 0) ──────────│  → DisplaySink  │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `DisplayServer::start` - Bind the listener and spawn the accept loop
//! 2. Accept loop registers a `Session` per connection
//! 3. `Session` reads the handshake, answers "ready", streams buckets
//! 4. Buckets are decoded and written on the `WorkerPool`
//! 5. `IMAGE_END` or a fault hands the framebuffer to the sink
//! 6. `DisplayServer::stop` - Close the listener, drain or abandon sessions
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `server` | Accept loop, session registry, start/stop |
//! | `session` | Per-connection state machine |
//! | `worker` | Bounded bucket worker pool |

// ============================================================================
// Submodules
// ============================================================================

/// Display server and session registry.
pub mod server;

/// Per-connection session state machine.
pub mod session;

/// Bucket worker pool.
pub mod worker;

// ============================================================================
// Re-exports
// ============================================================================

pub use server::{DisplayServer, IdleHook};
pub use session::{Session, SessionProgress, SessionReport, SessionState};
pub use worker::{BucketTasks, WorkerPool};
