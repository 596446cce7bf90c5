//! Per-connection session state machine.
//!
//! # States
//!
//! ```text
//! AwaitingHandshake ──► Streaming ──► Closed
//!        │                  │
//!        └──────► Error ◄───┘
//! ```
//!
//! - **AwaitingHandshake**: read the handshake, allocate the framebuffer,
//!   begin the display frame, answer "ready".
//! - **Streaming**: read command headers. `IMAGE_DATA` buckets are queued on
//!   the worker pool and the loop moves on at once; `IMAGE_END` drains the
//!   queue.
//! - **Closed**: hand the finished framebuffer to the sink and close.
//! - **Error**: log, release, and hand off the partial framebuffer only
//!   under [`PartialFramePolicy::BestEffort`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{PartialFramePolicy, ServerConfig};
use crate::display::DisplaySink;
use crate::error::{Error, Result};
use crate::framebuffer::BufferAssembler;
use crate::identifiers::{FrameHandle, SessionId};
use crate::protocol::{Command, READY_RESPONSE, read_command, read_handshake, read_image_data};

use super::worker::{BucketTasks, WorkerPool};

// ============================================================================
// SessionState
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, handshake not yet read.
    AwaitingHandshake,
    /// Receiving buckets.
    Streaming,
    /// Finished normally.
    Closed,
    /// Terminated by a fault or cancellation.
    Error,
}

impl SessionState {
    /// Returns `true` for `Closed` and `Error`.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingHandshake => "awaiting_handshake",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

// ============================================================================
// SessionProgress
// ============================================================================

/// Counters shared between a session, its bucket tasks and the registry.
#[derive(Debug, Default)]
pub struct SessionProgress {
    /// Framebuffer pixels, zero before handshake.
    total_pixels: AtomicU64,
    /// Pixels written so far.
    covered_pixels: AtomicU64,
    /// Buckets written so far.
    buckets: AtomicU64,
    /// Cumulative worker time.
    processing_nanos: AtomicU64,
}

impl SessionProgress {
    /// Sets the framebuffer size once it is known.
    pub fn set_total(&self, pixels: u64) {
        self.total_pixels.store(pixels, Ordering::Release);
    }

    /// Records one written bucket.
    pub fn record_bucket(&self, pixels: u64, elapsed: Duration) {
        self.covered_pixels.fetch_add(pixels, Ordering::AcqRel);
        self.processing_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.buckets.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the framebuffer size in pixels.
    #[inline]
    #[must_use]
    pub fn total_pixels(&self) -> u64 {
        self.total_pixels.load(Ordering::Acquire)
    }

    /// Returns the pixels written so far.
    #[inline]
    #[must_use]
    pub fn covered_pixels(&self) -> u64 {
        self.covered_pixels.load(Ordering::Acquire)
    }

    /// Returns the buckets written so far.
    #[inline]
    #[must_use]
    pub fn buckets(&self) -> u64 {
        self.buckets.load(Ordering::Acquire)
    }

    /// Returns the cumulative worker time.
    #[inline]
    #[must_use]
    pub fn processing_time(&self) -> Duration {
        Duration::from_nanos(self.processing_nanos.load(Ordering::Relaxed))
    }

    /// Returns completion in percent, `None` before handshake.
    #[must_use]
    pub fn percentage(&self) -> Option<f32> {
        let total = self.total_pixels();
        if total == 0 {
            return None;
        }
        let covered = self.covered_pixels().min(total);
        Some((covered as f64 * 100.0 / total as f64) as f32)
    }
}

// ============================================================================
// SessionReport
// ============================================================================

/// Summary emitted when a session ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Session that ended.
    pub session_id: SessionId,
    /// Renderer address.
    pub peer: SocketAddr,
    /// Image name from the handshake.
    pub image_name: Option<String>,
    /// Terminal state.
    pub state: SessionState,
    /// Buckets written.
    pub buckets: u64,
    /// Cumulative worker time.
    pub processing_time: Duration,
    /// Whether pixels reached the sink at close.
    pub handed_off: bool,
    /// Fault that ended the session, if any.
    pub error: Option<String>,
}

impl SessionReport {
    /// Report for a session task that died without producing one.
    #[must_use]
    pub fn aborted(session_id: SessionId, peer: SocketAddr, reason: impl Into<String>) -> Self {
        Self {
            session_id,
            peer,
            image_name: None,
            state: SessionState::Error,
            buckets: 0,
            processing_time: Duration::ZERO,
            handed_off: false,
            error: Some(reason.into()),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Periodic `update_frame` pusher.
struct ProgressPusher {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// State of one renderer connection.
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    sink: Arc<dyn DisplaySink>,
    cancel: CancellationToken,
    progress: Arc<SessionProgress>,
    state: SessionState,
    image_name: Option<String>,
    assembler: Option<Arc<BufferAssembler>>,
    frame: Option<FrameHandle>,
    tasks: BucketTasks,
    pusher: Option<ProgressPusher>,
}

impl Session {
    /// Creates a session in [`SessionState::AwaitingHandshake`].
    #[must_use]
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        config: Arc<ServerConfig>,
        sink: Arc<dyn DisplaySink>,
        pool: WorkerPool,
        cancel: CancellationToken,
        progress: Arc<SessionProgress>,
    ) -> Self {
        let tasks = BucketTasks::new(
            pool,
            config.max_pending_buckets,
            config.queue_timeout,
            Arc::clone(&progress),
        );

        Self {
            id,
            peer,
            config,
            sink,
            cancel,
            progress,
            state: SessionState::AwaitingHandshake,
            image_name: None,
            assembler: None,
            frame: None,
            tasks,
            pusher: None,
        }
    }

    /// Returns the session ID.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session over `stream` to completion.
    pub async fn run(self, stream: TcpStream) -> SessionReport {
        let (read_half, write_half) = stream.into_split();
        self.run_io(BufReader::new(read_half), write_half).await
    }

    /// Runs the session over any reader/writer pair.
    pub async fn run_io<R, W>(mut self, mut reader: R, mut writer: W) -> SessionReport
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.drive(&mut reader, &mut writer) => result,
        };

        let report = self.finish(outcome).await;
        let _ = writer.shutdown().await;
        report
    }

    /// Handshake followed by the streaming loop.
    async fn drive<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let assembler = self.handshake(reader, writer).await?;
        self.stream(reader, &assembler).await
    }

    /// Reads the handshake, allocates the framebuffer and answers "ready".
    async fn handshake<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<Arc<BufferAssembler>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let limit = self.config.handshake_timeout;
        let request = timeout(limit, read_handshake(reader))
            .await
            .map_err(|_| Error::handshake_timeout(limit.as_millis() as u64))??;

        let descriptor = request.descriptor;
        self.image_name = Some(request.image_name);

        let assembler = Arc::new(BufferAssembler::new(
            descriptor,
            self.config.pixel_byte_order,
            self.config.max_framebuffer_pixels,
        )?);
        self.progress.set_total(descriptor.pixel_count());
        self.assembler = Some(Arc::clone(&assembler));

        let side = |len: u64| {
            u32::try_from(len)
                .map_err(|_| Error::resource(format!("framebuffer side of {len} pixels")))
        };
        let (width, height) = (side(descriptor.width())?, side(descriptor.height())?);
        let handle = self
            .sink
            .begin_frame(descriptor.xmin, descriptor.ymin, width, height);
        self.frame = Some(handle);

        writer.write_all(&READY_RESPONSE).await?;
        writer.flush().await?;

        info!(
            session_id = %self.id,
            image = self.image_name.as_deref().unwrap_or_default(),
            bounds = %descriptor.bounds(),
            pixel_size = descriptor.pixel_size(),
            channels = descriptor.channel_count(),
            "Handshake complete"
        );

        self.pusher = self.spawn_pusher(&assembler, handle);
        self.transition(SessionState::Streaming);
        Ok(assembler)
    }

    /// Reads commands until `IMAGE_END`.
    async fn stream<R>(&mut self, reader: &mut R, assembler: &Arc<BufferAssembler>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let descriptor = *assembler.descriptor();
        let mut reader = IdleReader::new(reader, self.config.idle_timeout);

        loop {
            reader.arm();
            let command = read_command(&mut reader).await;
            let command = reader.settle(command)?;

            match command {
                Command::ImageData => {
                    reader.arm();
                    let bucket = read_image_data(&mut reader, &descriptor).await;
                    let bucket = reader.settle(bucket)?;
                    trace!(session_id = %self.id, rect = %bucket.rect(), "IMAGE_DATA");
                    self.tasks.submit(Arc::clone(assembler), bucket).await?;
                }
                Command::ImageEnd => {
                    debug!(
                        session_id = %self.id,
                        outstanding = self.tasks.outstanding(),
                        "IMAGE_END, draining buckets"
                    );
                    self.tasks.drain().await?;
                    self.transition(SessionState::Closed);
                    return Ok(());
                }
                Command::Unknown(code) => return Err(Error::unknown_command(code)),
            }
        }
    }

    /// Hands off the framebuffer per outcome and policy, then reports.
    async fn finish(&mut self, outcome: Result<()>) -> SessionReport {
        if let Some(pusher) = self.pusher.take() {
            pusher.stop.cancel();
            let _ = pusher.task.await;
        }

        let error = match outcome {
            Ok(()) => None,
            Err(err) => {
                warn!(
                    session_id = %self.id,
                    state = %self.state,
                    error = %err,
                    "Session failed"
                );
                self.transition(SessionState::Error);

                let best_effort = self.config.partial_frame == PartialFramePolicy::BestEffort;
                if best_effort && !matches!(err, Error::Cancelled) {
                    // Errors are already reported; only quiescence matters here.
                    let _ = self.tasks.drain().await;
                } else {
                    self.tasks.abandon().await;
                }
                Some(err)
            }
        };

        let hand_off = error.is_none() || self.config.partial_frame == PartialFramePolicy::BestEffort;
        let mut handed_off = false;
        if let Some(handle) = self.frame.take() {
            if hand_off && let Some(assembler) = &self.assembler {
                assembler.with_frame(|fb| self.sink.update_frame(handle, fb.pixels()));
                handed_off = true;
            }
            self.sink.end_frame(handle);
        }
        // Release the framebuffer now rather than when the report is dropped.
        self.assembler = None;

        let report = SessionReport {
            session_id: self.id,
            peer: self.peer,
            image_name: self.image_name.clone(),
            state: self.state,
            buckets: self.progress.buckets(),
            processing_time: self.progress.processing_time(),
            handed_off,
            error: error.map(|e| e.to_string()),
        };

        info!(
            session_id = %self.id,
            state = %report.state,
            buckets = report.buckets,
            processing_ms = report.processing_time.as_millis() as u64,
            handed_off,
            "Session ended"
        );

        report
    }

    /// Spawns the periodic partial hand-off, if configured.
    fn spawn_pusher(
        &self,
        assembler: &Arc<BufferAssembler>,
        handle: FrameHandle,
    ) -> Option<ProgressPusher> {
        let period = self.config.progress_interval?;
        let stop = self.cancel.child_token();
        let task = tokio::spawn(push_progress(
            Arc::clone(&self.sink),
            Arc::clone(assembler),
            Arc::clone(&self.progress),
            handle,
            period,
            stop.clone(),
        ));
        Some(ProgressPusher { stop, task })
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = %self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Reader that fails once no byte has arrived for the idle timeout.
///
/// The deadline restarts on every read that makes progress, so a slow but
/// steady bucket never expires.
struct IdleReader<'a, R> {
    inner: &'a mut R,
    limit: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    expired: bool,
}

impl<'a, R> IdleReader<'a, R> {
    fn new(inner: &'a mut R, limit: Option<Duration>) -> Self {
        Self {
            inner,
            limit,
            deadline: limit.map(|limit| Box::pin(sleep(limit))),
            expired: false,
        }
    }

    /// Restarts the silence window.
    fn arm(&mut self) {
        if let (Some(limit), Some(deadline)) = (self.limit, self.deadline.as_mut()) {
            deadline.as_mut().reset(Instant::now() + limit);
        }
    }

    /// Replaces the I/O error of an expired read with the idle timeout.
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        match self.limit {
            Some(limit) if self.expired => Err(Error::idle_timeout(limit.as_millis() as u64)),
            _ => result,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for IdleReader<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();

        match Pin::new(&mut *this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if buf.filled().len() > before {
                    this.arm();
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                let fired = this
                    .deadline
                    .as_mut()
                    .is_some_and(|deadline| deadline.as_mut().poll(cx).is_ready());
                if fired {
                    this.expired = true;
                    return Poll::Ready(Err(IoError::from(ErrorKind::TimedOut)));
                }
                Poll::Pending
            }
        }
    }
}

/// Pushes the framebuffer every `period` while new buckets keep landing.
async fn push_progress(
    sink: Arc<dyn DisplaySink>,
    assembler: Arc<BufferAssembler>,
    progress: Arc<SessionProgress>,
    handle: FrameHandle,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut pushed = 0;
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let buckets = progress.buckets();
                if buckets != pushed {
                    pushed = buckets;
                    let pixels = assembler.snapshot();
                    sink.update_frame(handle, &pixels);
                    trace!(%handle, buckets, "Progress pushed");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, duplex};

    use crate::config::PixelByteOrder;
    use crate::framebuffer::{ChannelLayout, Rgba};
    use crate::protocol::{
        FramebufferDescriptor, HandshakeRequest, Rect, encode_image_data, encode_image_end,
    };

    #[derive(Default)]
    struct Recorder {
        begun: Mutex<Vec<(u32, u32, u32, u32)>>,
        updates: Mutex<Vec<Vec<Rgba>>>,
        ended: Mutex<usize>,
    }

    impl DisplaySink for Recorder {
        fn begin_frame(&self, x0: u32, y0: u32, width: u32, height: u32) -> FrameHandle {
            self.begun.lock().push((x0, y0, width, height));
            FrameHandle::new(1)
        }

        fn update_frame(&self, _handle: FrameHandle, pixels: &[Rgba]) {
            self.updates.lock().push(pixels.to_vec());
        }

        fn end_frame(&self, _handle: FrameHandle) {
            *self.ended.lock() += 1;
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9)
    }

    fn session(config: ServerConfig, sink: Arc<Recorder>) -> Session {
        Session::new(
            SessionId::next(),
            peer(),
            Arc::new(config),
            sink,
            WorkerPool::new(2),
            CancellationToken::new(),
            Arc::new(SessionProgress::default()),
        )
    }

    fn config() -> ServerConfig {
        ServerConfig::new().with_progress_interval(None)
    }

    fn solid(descriptor: &FramebufferDescriptor, rect: Rect, rgba: Rgba) -> Vec<u8> {
        let layout = ChannelLayout::new(descriptor, PixelByteOrder::Little);
        let pixel: Vec<f32> = layout
            .encode(rgba)
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        encode_image_data(rect, &pixel.repeat(rect.area() as usize), PixelByteOrder::Little)
    }

    /// Runs a session against an in-memory stream carrying `input`.
    async fn run(session: Session, input: Vec<u8>) -> (SessionReport, Vec<u8>) {
        let (client, server) = duplex(1 << 20);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(&input).await.unwrap();
        client_write.shutdown().await.unwrap();

        let report = session
            .run_io(BufReader::new(server_read), server_write)
            .await;
        let mut answer = Vec::new();
        client_read.read_to_end(&mut answer).await.unwrap();
        (report, answer)
    }

    #[tokio::test]
    async fn test_full_frame() {
        let sink = Arc::new(Recorder::default());
        let descriptor = FramebufferDescriptor::rgba(0, 63, 0, 63);
        let first = [1.0, 0.0, 0.0, 1.0];
        let second = [0.0, 1.0, 0.0, 1.0];

        let mut input = HandshakeRequest::new("beauty", descriptor).encode().unwrap();
        input.extend(solid(&descriptor, Rect::new(0, 63, 0, 31), first));
        input.extend(solid(&descriptor, Rect::new(0, 63, 32, 63), second));
        input.extend(encode_image_end());

        let (report, answer) = run(session(config(), Arc::clone(&sink)), input).await;

        assert_eq!(answer, READY_RESPONSE);
        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.buckets, 2);
        assert_eq!(report.image_name.as_deref(), Some("beauty"));
        assert!(report.handed_off);
        assert!(report.error.is_none());

        assert_eq!(*sink.begun.lock(), vec![(0, 0, 64, 64)]);
        assert_eq!(*sink.ended.lock(), 1);
        let updates = sink.updates.lock();
        let last = updates.last().expect("final hand-off");
        assert_eq!(last.len(), 64 * 64);
        assert!(last[..32 * 64].iter().all(|p| *p == second));
        assert!(last[32 * 64..].iter().all(|p| *p == first));
    }

    #[tokio::test]
    async fn test_unknown_command_fails_session() {
        let sink = Arc::new(Recorder::default());
        let descriptor = FramebufferDescriptor::rgba(0, 7, 0, 7);

        let mut input = HandshakeRequest::new("img", descriptor).encode().unwrap();
        input.extend([42, 0]);

        let (report, _) = run(session(config(), Arc::clone(&sink)), input).await;

        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.error.as_deref(), Some("Unknown command: 42"));
        assert!(!report.handed_off);
        assert!(sink.updates.lock().is_empty());
        assert_eq!(*sink.ended.lock(), 1);
    }

    #[tokio::test]
    async fn test_out_of_bounds_best_effort_keeps_valid_buckets() {
        let sink = Arc::new(Recorder::default());
        let descriptor = FramebufferDescriptor::rgba(0, 7, 0, 7);
        let color = [0.5, 0.5, 0.5, 1.0];

        let mut input = HandshakeRequest::new("img", descriptor).encode().unwrap();
        input.extend(solid(&descriptor, Rect::new(0, 7, 0, 3), color));
        input.extend(solid(&descriptor, Rect::new(0, 8, 4, 7), color));

        let cfg = config().with_partial_frame(PartialFramePolicy::BestEffort);
        let (report, _) = run(session(cfg, Arc::clone(&sink)), input).await;

        assert_eq!(report.state, SessionState::Error);
        assert!(report.handed_off);
        let updates = sink.updates.lock();
        let partial = updates.last().expect("partial hand-off");
        assert!(partial[..32].iter().all(|p| *p == [0.0; 4]));
        assert!(partial[32..].iter().all(|p| *p == color));
    }

    #[tokio::test]
    async fn test_eof_mid_stream_is_transport_error() {
        let sink = Arc::new(Recorder::default());
        let descriptor = FramebufferDescriptor::rgba(0, 7, 0, 7);
        let mut input = HandshakeRequest::new("img", descriptor).encode().unwrap();
        let bucket = solid(&descriptor, Rect::new(0, 7, 0, 7), [1.0; 4]);
        input.extend(&bucket[..bucket.len() / 2]);

        let (report, _) = run(session(config(), Arc::clone(&sink)), input).await;

        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.error.as_deref(), Some("Connection closed"));
        assert!(sink.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_framebuffer_rejected_before_ready() {
        let sink = Arc::new(Recorder::default());
        let input = HandshakeRequest::new("big", FramebufferDescriptor::rgba(0, 99, 0, 99))
            .encode()
            .unwrap();

        let cfg = config().with_max_framebuffer_pixels(1000);
        let (report, answer) = run(session(cfg, Arc::clone(&sink)), input).await;

        assert!(answer.is_empty());
        assert_eq!(report.state, SessionState::Error);
        assert!(sink.begun.lock().is_empty());
        assert_eq!(*sink.ended.lock(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_handshake() {
        let sink = Arc::new(Recorder::default());
        let session = session(config(), Arc::clone(&sink));
        let cancel = session.cancel.clone();

        let (_client, server) = duplex(64);
        let (read, write) = tokio::io::split(server);
        cancel.cancel();
        let report = session.run_io(BufReader::new(read), write).await;

        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.error.as_deref(), Some("Cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let sink = Arc::new(Recorder::default());
        let cfg = config().with_idle_timeout(Some(Duration::from_millis(100)));
        let session = session(cfg, Arc::clone(&sink));

        let (mut client, server) = duplex(1 << 16);
        let (read, write) = tokio::io::split(server);
        let input = HandshakeRequest::new("img", FramebufferDescriptor::rgba(0, 7, 0, 7))
            .encode()
            .unwrap();
        client.write_all(&input).await.unwrap();

        let report = session.run_io(BufReader::new(read), write).await;
        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.error.as_deref(), Some("Idle timeout after 100ms"));
        drop(client);
    }

    #[tokio::test]
    async fn test_progress_pushed_while_streaming() {
        let sink = Arc::new(Recorder::default());
        let cfg = config().with_progress_interval(Some(Duration::from_millis(20)));
        let session = session(cfg, Arc::clone(&sink));
        let descriptor = FramebufferDescriptor::rgba(0, 7, 0, 7);
        let color = [0.25, 0.5, 0.75, 1.0];

        let (client, server) = duplex(1 << 16);
        let (read, write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let running = tokio::spawn(session.run_io(BufReader::new(read), write));

        let mut input = HandshakeRequest::new("img", descriptor).encode().unwrap();
        input.extend(solid(&descriptor, Rect::new(0, 7, 0, 3), color));
        client_write.write_all(&input).await.unwrap();

        let mut pushed = false;
        for _ in 0..200 {
            if !sink.updates.lock().is_empty() {
                pushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pushed, "no progress push");
        assert!(sink.updates.lock()[0][32..].iter().all(|p| *p == color));
        assert_eq!(*sink.ended.lock(), 0);

        client_write.write_all(&encode_image_end()).await.unwrap();
        client_write.shutdown().await.unwrap();
        let report = running.await.unwrap();
        let mut answer = Vec::new();
        client_read.read_to_end(&mut answer).await.unwrap();

        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(*sink.ended.lock(), 1);
        assert!(sink.updates.lock().len() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_restarts_on_each_read() {
        let sink = Arc::new(Recorder::default());
        let cfg = config().with_idle_timeout(Some(Duration::from_millis(200)));
        let session = session(cfg, Arc::clone(&sink));
        let descriptor = FramebufferDescriptor::rgba(0, 7, 0, 7);
        let color = [0.25, 0.5, 0.75, 1.0];

        let (client, server) = duplex(1 << 16);
        let (read, write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let running = tokio::spawn(session.run_io(BufReader::new(read), write));

        let handshake = HandshakeRequest::new("slow", descriptor).encode().unwrap();
        client_write.write_all(&handshake).await.unwrap();

        // Eight chunks 100ms apart: the bucket takes 800ms, silence never exceeds 100ms.
        let bucket = solid(&descriptor, Rect::new(0, 7, 0, 7), color);
        for chunk in bucket.chunks(bucket.len().div_ceil(8)) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client_write.write_all(chunk).await.unwrap();
        }
        client_write.write_all(&encode_image_end()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let report = running.await.unwrap();
        let mut answer = Vec::new();
        client_read.read_to_end(&mut answer).await.unwrap();

        assert_eq!(report.state, SessionState::Closed, "{:?}", report.error);
        assert_eq!(report.buckets, 1);
        let updates = sink.updates.lock();
        assert!(updates.last().unwrap().iter().all(|p| *p == color));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_reported_as_such() {
        let sink = Arc::new(Recorder::default());
        let cfg = config().with_handshake_timeout(Duration::from_millis(500));
        let session = session(cfg, Arc::clone(&sink));

        let (_client, server) = duplex(64);
        let (read, write) = tokio::io::split(server);
        let report = session.run_io(BufReader::new(read), write).await;

        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.error.as_deref(), Some("Handshake timed out after 500ms"));
        assert!(sink.begun.lock().is_empty());
    }

    #[test]
    fn test_progress_percentage() {
        let progress = SessionProgress::default();
        assert_eq!(progress.percentage(), None);
        progress.set_total(200);
        progress.record_bucket(50, Duration::from_millis(3));
        assert_eq!(progress.percentage(), Some(25.0));
        assert_eq!(progress.buckets(), 1);
        assert_eq!(progress.processing_time(), Duration::from_millis(3));
    }

    #[test]
    fn test_state_terminal() {
        assert!(!SessionState::AwaitingHandshake.is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Error.is_terminal());
        assert_eq!(SessionState::Streaming.to_string(), "streaming");
    }
}
