//! Bucket worker pool.
//!
//! Bucket decoding and framebuffer writes are CPU-bound, so they run on
//! tokio's blocking threads instead of the connection's read loop.
//!
//! # Architecture
//!
//! ```text
//!  Session read loop                      WorkerPool (server-wide)
//!  ─────────────────                      ────────────────────────
//!  IMAGE_DATA ──► BucketTasks::submit ──► permit (1 of `workers`)
//!                 (admission: 1 of          └─► spawn_blocking(apply_bucket)
//!                  `max_pending_buckets`)
//!  IMAGE_END  ──► BucketTasks::drain  ◄── all outstanding tasks joined
//! ```
//!
//! Tasks start in submission order but may finish in any order once more
//! than one worker is configured; buckets cover disjoint rectangles, so the
//! final framebuffer does not depend on it.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};
use crate::framebuffer::{Bucket, BufferAssembler};

use super::session::SessionProgress;

// ============================================================================
// WorkerPool
// ============================================================================

/// Bounded set of workers shared by every session of a server.
///
/// Cloning is cheap; clones share the same permits.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    /// One permit per worker.
    permits: Arc<Semaphore>,
    /// Configured worker count.
    size: usize,
}

impl WorkerPool {
    /// Creates a pool running at most `size` jobs at once.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Returns the configured worker count.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of idle workers.
    #[inline]
    #[must_use]
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stops handing out workers. Jobs already running finish; jobs still
    /// waiting fail with [`Error::Cancelled`].
    pub fn close(&self) {
        self.permits.close();
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Runs `job` on a blocking thread once a worker is free.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the pool was closed
    /// - [`Error::Worker`] if the job panicked
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;

        tokio::task::spawn_blocking(move || {
            // Held for the job's lifetime even if the awaiting task is aborted.
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| Error::worker(format!("bucket task failed: {e}")))
    }
}

// ============================================================================
// BucketTasks
// ============================================================================

/// Outstanding bucket tasks of one session.
#[derive(Debug)]
pub struct BucketTasks {
    /// Server-wide workers.
    pool: WorkerPool,
    /// Admission slots; one per queued or running bucket. A running job
    /// holds its slot on the blocking thread until it returns.
    slots: Arc<Semaphore>,
    /// Slot count.
    limit: usize,
    /// Longest wait for a slot.
    queue_timeout: Duration,
    /// Session counters.
    progress: Arc<SessionProgress>,
    /// Running and finished-but-unjoined tasks.
    tasks: JoinSet<Result<()>>,
}

impl BucketTasks {
    /// Creates an empty task set.
    #[must_use]
    pub fn new(
        pool: WorkerPool,
        limit: usize,
        queue_timeout: Duration,
        progress: Arc<SessionProgress>,
    ) -> Self {
        let limit = limit.clamp(1, u32::MAX as usize);
        Self {
            pool,
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            queue_timeout,
            progress,
            tasks: JoinSet::new(),
        }
    }

    /// Returns the number of tasks not yet joined.
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Queues `bucket` for writing and returns without waiting for it.
    ///
    /// Only waits when `max_pending_buckets` tasks are already outstanding.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if no slot frees up within the queue timeout
    /// - any error of an earlier task that has finished since the last call
    pub async fn submit(&mut self, assembler: Arc<BufferAssembler>, bucket: Bucket) -> Result<()> {
        self.reap()?;
        let slot = self.admit().await?;

        let pixels = bucket.rect().area();
        self.spawn_job(slot, pixels, move || {
            let start = Instant::now();
            assembler.apply_bucket(&bucket).map(|()| start.elapsed())
        });
        Ok(())
    }

    /// Waits up to the queue timeout for an admission slot.
    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        match timeout(self.queue_timeout, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(slot)) => Ok(slot),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::queue_full(
                self.limit,
                self.queue_timeout.as_millis() as u64,
            )),
        }
    }

    /// Spawns `job` on the pool and credits `pixels` once it succeeds.
    fn spawn_job<F>(&mut self, slot: OwnedSemaphorePermit, pixels: u64, job: F)
    where
        F: FnOnce() -> Result<Duration> + Send + 'static,
    {
        let pool = self.pool.clone();
        let progress = Arc::clone(&self.progress);
        self.tasks.spawn(async move {
            let elapsed = pool
                .run(move || {
                    let _slot = slot;
                    job()
                })
                .await??;
            progress.record_bucket(pixels, elapsed);
            Ok(())
        });
    }

    /// Joins tasks that already finished.
    ///
    /// # Errors
    ///
    /// Returns the first failure among them.
    pub fn reap(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            flatten(joined)?;
        }
        Ok(())
    }

    /// Waits for every outstanding task.
    ///
    /// All tasks are joined even after a failure, so the framebuffer is
    /// quiescent when this returns.
    ///
    /// # Errors
    ///
    /// Returns the first failure.
    pub async fn drain(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = flatten(joined) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drops queued tasks and waits for jobs already on a blocking thread
    /// to return, so the framebuffer is quiescent afterwards.
    pub async fn abandon(&mut self) {
        let dropped = self.tasks.len();
        self.tasks.shutdown().await;
        // Aborting a task does not stop its blocking job; every job gives its
        // slot back on return.
        let limit = u32::try_from(self.limit).unwrap_or(u32::MAX);
        if let Ok(all) = self.slots.acquire_many(limit).await {
            drop(all);
        }
        if dropped > 0 {
            debug!(dropped, "Abandoned bucket tasks");
        }
    }
}

/// Maps a join outcome onto the crate error.
fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| Error::worker(format!("bucket task failed: {e}")))?
}

// ============================================================================
// Tests
// ============================================================================
