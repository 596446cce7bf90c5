//! Display server: connection acceptor and session registry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 DisplayServer                    │
//! │                                                  │
//! │  accept loop ──► Session S1 ──┐                  │
//! │      │      ──► Session S2 ──┼──► WorkerPool     │
//! │      │      ──► Session S3 ──┘    (`workers`)    │
//! │      ▼                                           │
//! │  registry { S1, S2, S3 }  ◄── SessionReport      │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! The accept loop is the only writer of the registry. Sessions report back
//! over a channel when they end; the loop removes the entry and fires the
//! idle hook once the registry is empty.
//!
//! # Shutdown
//!
//! [`DisplayServer::stop`] closes the listener first, then follows
//! [`ShutdownPolicy`]: `Drain` lets live sessions finish within the drain
//! timeout, `Abandon` cancels them and closes the worker pool.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, ShutdownPolicy};
use crate::display::DisplaySink;
use crate::error::Result;
use crate::identifiers::SessionId;

use super::session::{Session, SessionProgress, SessionReport};
use super::worker::WorkerPool;

// ============================================================================
// Types
// ============================================================================

/// Callback fired when the last live session ends.
pub type IdleHook = Arc<dyn Fn() + Send + Sync>;

/// Registry entry of a live session.
#[derive(Debug, Clone)]
struct SessionEntry {
    peer: SocketAddr,
    cancel: CancellationToken,
    progress: Arc<SessionProgress>,
}

type Registry = Arc<RwLock<FxHashMap<SessionId, SessionEntry>>>;

/// Handle to a started accept loop.
struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// ============================================================================
// DisplayServer
// ============================================================================

/// TCP server that turns renderer connections into display frames.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use dspy_server::{DisplayServer, NullSink, ServerConfig};
///
/// # async fn run() -> dspy_server::Result<()> {
/// let server = DisplayServer::new(ServerConfig::new(), Arc::new(NullSink::new()))?
///     .with_idle_hook(Arc::new(|| println!("all renders finished")));
///
/// let addr = server.start().await?;
/// println!("listening on {addr}");
///
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct DisplayServer {
    config: Arc<ServerConfig>,
    sink: Arc<dyn DisplaySink>,
    registry: Registry,
    on_idle: Option<IdleHook>,
    /// Bound address while running, readable without awaiting.
    local: RwLock<Option<SocketAddr>>,
    /// Serializes `start` and `stop`.
    lifecycle: Mutex<Option<Running>>,
}

impl fmt::Debug for DisplayServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayServer")
            .field("config", &self.config)
            .field("local_addr", &*self.local.read())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// DisplayServer - Constructor
// ============================================================================

impl DisplayServer {
    /// Creates a stopped server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if `config` is invalid.
    pub fn new(config: ServerConfig, sink: Arc<dyn DisplaySink>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            sink,
            registry: Arc::new(RwLock::new(FxHashMap::default())),
            on_idle: None,
            local: RwLock::new(None),
            lifecycle: Mutex::new(None),
        })
    }

    /// Sets the hook fired whenever the registry becomes empty.
    #[must_use]
    pub fn with_idle_hook(mut self, hook: IdleHook) -> Self {
        self.on_idle = Some(hook);
        self
    }
}

// ============================================================================
// DisplayServer - Lifecycle
// ============================================================================

impl DisplayServer {
    /// Binds the listener and starts accepting renderers.
    ///
    /// Calling `start` on a running server returns its address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if binding fails.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = lifecycle.as_ref() {
            return Ok(running.addr);
        }

        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let acceptor = Acceptor {
            config: Arc::clone(&self.config),
            sink: Arc::clone(&self.sink),
            pool: WorkerPool::new(self.config.workers),
            registry: Arc::clone(&self.registry),
            on_idle: self.on_idle.clone(),
            cancel: cancel.clone(),
            done_tx,
            done_rx,
            sessions: JoinSet::new(),
        };
        let task = tokio::spawn(acceptor.run(listener));

        *lifecycle = Some(Running { addr, cancel, task });
        *self.local.write() = Some(addr);

        info!(
            %addr,
            workers = self.config.workers,
            shutdown = ?self.config.shutdown,
            "Display server started"
        );
        Ok(addr)
    }

    /// Stops accepting, then drains or abandons live sessions.
    ///
    /// Returns once the listener is closed and every session has ended.
    /// Calling `stop` on a stopped server does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return;
        };

        info!(addr = %running.addr, "Display server stopping");
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            error!(error = %e, "Accept loop failed");
        }

        *self.local.write() = None;
        info!(addr = %running.addr, "Display server stopped");
    }
}

// ============================================================================
// DisplayServer - Queries
// ============================================================================

impl DisplayServer {
    /// Returns the bound address while running.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.read()
    }

    /// Returns `true` between `start` and `stop`.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.local.read().is_some()
    }

    /// Returns the number of live sessions.
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Returns the percentage of framebuffer pixels written across live
    /// sessions, or `None` when no session has completed its handshake.
    #[must_use]
    pub fn query_progress(&self) -> Option<f32> {
        let registry = self.registry.read();
        let (covered, total) = registry.values().fold((0u64, 0u64), |(covered, total), entry| {
            let session_total = entry.progress.total_pixels();
            (
                covered.saturating_add(entry.progress.covered_pixels().min(session_total)),
                total.saturating_add(session_total),
            )
        });

        (total > 0).then(|| (covered as f64 * 100.0 / total as f64) as f32)
    }
}

impl Drop for DisplayServer {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

// ============================================================================
// Acceptor
// ============================================================================

/// State owned by the accept loop task.
struct Acceptor {
    config: Arc<ServerConfig>,
    sink: Arc<dyn DisplaySink>,
    pool: WorkerPool,
    registry: Registry,
    on_idle: Option<IdleHook>,
    cancel: CancellationToken,
    done_tx: mpsc::UnboundedSender<SessionReport>,
    done_rx: mpsc::UnboundedReceiver<SessionReport>,
    sessions: JoinSet<()>,
}

impl Acceptor {
    async fn run(mut self, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(report) = self.done_rx.recv() => self.retire(report),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => error!(error = %e, "Accept failed"),
                },
            }
        }

        // Release the port before waiting on sessions.
        drop(listener);
        debug!(sessions = self.registry.read().len(), "Accept loop closed listener");

        match self.config.shutdown {
            ShutdownPolicy::Drain => self.drain().await,
            ShutdownPolicy::Abandon => self.abandon().await,
        }

        debug!("Accept loop terminated");
    }

    /// Registers and spawns a session for a new connection.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let session_id = SessionId::next();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(session_id = %session_id, error = %e, "set_nodelay failed");
        }

        let cancel = CancellationToken::new();
        let progress = Arc::new(SessionProgress::default());
        self.registry.write().insert(
            session_id,
            SessionEntry {
                peer,
                cancel: cancel.clone(),
                progress: Arc::clone(&progress),
            },
        );

        let session = Session::new(
            session_id,
            peer,
            Arc::clone(&self.config),
            Arc::clone(&self.sink),
            self.pool.clone(),
            cancel,
            progress,
        );

        info!(session_id = %session_id, ?peer, "Renderer connected");

        let done = self.done_tx.clone();
        self.sessions.spawn(async move {
            // A panicking session still has to leave the registry.
            let report = match tokio::spawn(session.run(stream)).await {
                Ok(report) => report,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Session task failed");
                    SessionReport::aborted(session_id, peer, format!("session task failed: {e}"))
                }
            };
            let _ = done.send(report);
        });
    }

    /// Removes an ended session and fires the idle hook if it was the last.
    fn retire(&mut self, report: SessionReport) {
        while self.sessions.try_join_next().is_some() {}

        let remaining = {
            let mut registry = self.registry.write();
            registry.remove(&report.session_id);
            registry.len()
        };

        debug!(
            session_id = %report.session_id,
            peer = ?report.peer,
            state = %report.state,
            remaining,
            "Session retired"
        );

        if remaining == 0
            && let Some(hook) = &self.on_idle
        {
            debug!("Registry empty, firing idle hook");
            hook();
        }
    }

    /// Waits for sessions up to the drain timeout, then abandons the rest.
    async fn drain(&mut self) {
        let deadline = Instant::now() + self.config.drain_timeout;

        while !self.registry.read().is_empty() {
            tokio::select! {
                Some(report) = self.done_rx.recv() => self.retire(report),
                () = sleep_until(deadline) => {
                    warn!(
                        sessions = self.registry.read().len(),
                        timeout_ms = self.config.drain_timeout.as_millis() as u64,
                        "Drain timeout elapsed, abandoning sessions"
                    );
                    self.abandon().await;
                    return;
                }
            }
        }
    }

    /// Cancels every session, closes the pool and waits for the reports.
    async fn abandon(&mut self) {
        self.pool.close();
        for (session_id, entry) in self.registry.read().iter() {
            debug!(session_id = %session_id, peer = ?entry.peer, "Cancelling session");
            entry.cancel.cancel();
        }

        while !self.registry.read().is_empty() {
            match self.done_rx.recv().await {
                Some(report) => self.retire(report),
                None => break,
            }
        }
        while self.sessions.join_next().await.is_some() {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use crate::display::NullSink;

    fn server() -> DisplayServer {
        let config = ServerConfig::new().with_port(0);
        DisplayServer::new(config, Arc::new(NullSink::new())).expect("server")
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let server = server();
        assert!(!server.is_running());

        let first = server.start().await.expect("start");
        let second = server.start().await.expect("start again");
        assert_eq!(first, second);
        assert!(first.port() > 0);
        assert_eq!(server.local_addr(), Some(first));

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let server = server();
        let addr = server.start().await.expect("start");
        server.stop().await;

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = server();
        server.start().await.expect("start");
        server.stop().await;
        let addr = server.start().await.expect("restart");
        assert!(TcpStream::connect(addr).await.is_ok());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ServerConfig::new().with_workers(0);
        let err = DisplayServer::new(config, Arc::new(NullSink::new())).unwrap_err();
        assert!(matches!(err, crate::Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_query_progress_idle() {
        let server = server();
        assert_eq!(server.query_progress(), None);
        server.start().await.expect("start");
        assert_eq!(server.query_progress(), None);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_idle_hook_after_disconnect() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let server = server().with_idle_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let addr = server.start().await.expect("start");

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(b"garbage").await.expect("write");
        stream.shutdown().await.expect("shutdown");
        drop(stream);

        for _ in 0..200 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(server.session_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_abandon_cancels_stalled_session() {
        let config = ServerConfig::new()
            .with_port(0)
            .with_shutdown(ShutdownPolicy::Abandon);
        let server = DisplayServer::new(config, Arc::new(NullSink::new())).expect("server");
        let addr = server.start().await.expect("start");

        let _stream = TcpStream::connect(addr).await.expect("connect");
        for _ in 0..200 {
            if server.session_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.session_count(), 1);

        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .expect("stop returns promptly");
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_bounds_stop() {
        let config = ServerConfig::new()
            .with_port(0)
            .with_drain_timeout(Duration::from_millis(100));
        let server = DisplayServer::new(config, Arc::new(NullSink::new())).expect("server");
        let addr = server.start().await.expect("start");

        let _stream = TcpStream::connect(addr).await.expect("connect");
        for _ in 0..200 {
            if server.session_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .expect("stop bounded by drain timeout");
        assert_eq!(server.session_count(), 0);
    }
}
