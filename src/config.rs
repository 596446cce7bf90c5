//! Server configuration.
//!
//! Provides a type-safe interface for configuring the listening socket,
//! the worker pool, timeouts and the fault policies of the display server.
//!
//! # Example
//!
//! ```ignore
//! use dspy_server::{PartialFramePolicy, ServerConfig};
//!
//! let config = ServerConfig::new()
//!     .with_port(0)
//!     .with_workers(4)
//!     .with_partial_frame(PartialFramePolicy::BestEffort);
//!
//! config.validate()?;
//! ```
//!
//! Configuration can also be loaded from JSON; durations are integer
//! milliseconds and missing keys take their defaults:
//!
//! ```json
//! { "port": 12345, "workers": 2, "idle_timeout": 60000, "shutdown": "abandon" }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default port the renderer connects to.
pub const DEFAULT_PORT: u16 = 12345;

/// Default number of bucket workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default per-session limit of buckets queued or in flight.
pub const DEFAULT_MAX_PENDING_BUCKETS: usize = 256;

/// Default largest framebuffer accepted at handshake (256 Mpx).
pub const DEFAULT_MAX_FRAMEBUFFER_PIXELS: u64 = 1 << 28;

const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Policies
// ============================================================================

/// What happens to an incomplete framebuffer when a session fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFramePolicy {
    /// Drop the buffer; the sink only sees `end_frame`.
    #[default]
    Discard,
    /// Push whatever was assembled before `end_frame`.
    BestEffort,
}

/// What `stop` does with sessions that are still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Let sessions finish, up to the drain timeout.
    #[default]
    Drain,
    /// Cancel sessions and drop queued bucket work.
    Abandon,
}

/// Byte order of the float32 pixel samples.
///
/// Header integers are always big-endian. Renderers write pixel floats in
/// host order, which is little-endian on every supported platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelByteOrder {
    /// Little-endian floats.
    #[default]
    Little,
    /// Big-endian floats.
    Big,
}

// ============================================================================
// ServerConfig
// ============================================================================

/// Display server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub host: IpAddr,

    /// Port to bind to (0 for random).
    pub port: u16,

    /// Number of buckets processed concurrently, server-wide.
    pub workers: usize,

    /// Buckets a session may have queued or in flight.
    pub max_pending_buckets: usize,

    /// How long a full queue may stall admission before the session fails.
    #[serde(with = "millis")]
    pub queue_timeout: Duration,

    /// Time allowed for the handshake after accept.
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,

    /// Longest silence tolerated while streaming.
    #[serde(with = "opt_millis")]
    pub idle_timeout: Option<Duration>,

    /// Cadence of partial `update_frame` pushes.
    #[serde(with = "opt_millis")]
    pub progress_interval: Option<Duration>,

    /// Hand-off policy for failed sessions.
    pub partial_frame: PartialFramePolicy,

    /// Session handling on `stop`.
    pub shutdown: ShutdownPolicy,

    /// Longest `stop` waits under [`ShutdownPolicy::Drain`].
    #[serde(with = "millis")]
    pub drain_timeout: Duration,

    /// Largest framebuffer accepted at handshake.
    pub max_framebuffer_pixels: u64,

    /// Byte order of pixel samples.
    pub pixel_byte_order: PixelByteOrder,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ServerConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            max_pending_buckets: DEFAULT_MAX_PENDING_BUCKETS,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            progress_interval: Some(DEFAULT_PROGRESS_INTERVAL),
            partial_frame: PartialFramePolicy::Discard,
            shutdown: ShutdownPolicy::Drain,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_framebuffer_pixels: DEFAULT_MAX_FRAMEBUFFER_PIXELS,
            pixel_byte_order: PixelByteOrder::Little,
        }
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value is out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ServerConfig {
    /// Sets the bind address.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Sets the bind port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the worker count.
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the per-session pending bucket limit.
    #[inline]
    #[must_use]
    pub fn with_max_pending_buckets(mut self, limit: usize) -> Self {
        self.max_pending_buckets = limit;
        self
    }

    /// Sets the admission timeout.
    #[inline]
    #[must_use]
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets or disables the idle timeout.
    #[inline]
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets or disables partial progress pushes.
    #[inline]
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Sets the partial frame policy.
    #[inline]
    #[must_use]
    pub fn with_partial_frame(mut self, policy: PartialFramePolicy) -> Self {
        self.partial_frame = policy;
        self
    }

    /// Sets the shutdown policy.
    #[inline]
    #[must_use]
    pub fn with_shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    /// Sets the drain timeout.
    #[inline]
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Sets the framebuffer size limit.
    #[inline]
    #[must_use]
    pub fn with_max_framebuffer_pixels(mut self, limit: u64) -> Self {
        self.max_framebuffer_pixels = limit;
        self
    }

    /// Sets the pixel byte order.
    #[inline]
    #[must_use]
    pub fn with_pixel_byte_order(mut self, order: PixelByteOrder) -> Self {
        self.pixel_byte_order = order;
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl ServerConfig {
    /// Returns the socket address to bind.
    #[inline]
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.max_pending_buckets == 0 {
            return Err(Error::config("max_pending_buckets must be at least 1"));
        }
        if self.queue_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(Error::config("timeouts must be greater than zero"));
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("idle_timeout must be greater than zero"));
        }
        if self.progress_interval.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("progress_interval must be greater than zero"));
        }
        if self.max_framebuffer_pixels == 0 {
            return Err(Error::config("max_framebuffer_pixels must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Duration Encoding
// ============================================================================

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

// ============================================================================
// Tests
// ============================================================================
