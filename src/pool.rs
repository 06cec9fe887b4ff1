//! Bounded-concurrency segment fetching.
//!
//! One task per segment, gated by a semaphore sized to the concurrency limit.
//! Each worker streams its range straight to its own offset in the
//! destination. Segments never overlap, so the file needs no lock. A failed
//! segment is recorded and left for the next attempt; siblings keep going.

use std::fs::File;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{DownloadError, FetchError};
use crate::source::{ByteRange, Source};
use crate::state::{ResumeStore, Segment, SegmentStatus};
use crate::stats::StatsReporter;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Global bandwidth cap shared by every worker.
#[derive(Debug)]
pub struct Throttle {
    limiter: DirectLimiter,
    burst: NonZeroU32,
}

impl Throttle {
    pub fn per_second(bytes: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(bytes)),
            burst: bytes,
        }
    }

    /// Waits until `len` bytes fit the budget. Chunks larger than one second of
    /// budget are paid for in slices.
    async fn acquire(&self, len: u64) {
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(u64::from(self.burst.get())) as u32;
            if let Some(n) = NonZeroU32::new(n) {
                let _ = self.limiter.until_n_ready(n).await;
            }
            remaining -= u64::from(n);
        }
    }
}

/// Everything a worker needs. Shared by all workers of one pass.
pub struct Pool {
    source: Arc<dyn Source>,
    file: Arc<File>,
    store: Arc<ResumeStore>,
    stats: StatsReporter,
    throttle: Option<Arc<Throttle>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    /// True when the plan has more than one segment, i.e. `Range` is sent.
    ranged: bool,
    /// Body length expected for a single-segment plan, when known.
    expected_single: Option<u64>,
}

/// How one worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    Skipped,
    Completed,
    Failed,
    Cancelled,
}

/// Tally of one full pass over the plan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl PassSummary {
    fn record(&mut self, outcome: SegmentOutcome) {
        match outcome {
            SegmentOutcome::Skipped => self.skipped += 1,
            SegmentOutcome::Completed => self.completed += 1,
            SegmentOutcome::Failed => self.failed += 1,
            SegmentOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

impl Pool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn Source>,
        file: Arc<File>,
        store: Arc<ResumeStore>,
        stats: StatsReporter,
        throttle: Option<Arc<Throttle>>,
        concurrency: usize,
        cancel: CancellationToken,
        ranged: bool,
        expected_single: Option<u64>,
    ) -> Self {
        Self {
            source,
            file,
            store,
            stats,
            throttle,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel,
            ranged,
            expected_single,
        }
    }

    /// Runs one worker per segment and waits for all of them.
    pub async fn run(self, segments: Vec<Segment>) -> Result<PassSummary, DownloadError> {
        let pool = Arc::new(self);
        let mut workers = JoinSet::new();
        for segment in segments {
            let pool = pool.clone();
            workers.spawn(async move { pool.run_segment(segment).await });
        }

        let mut summary = PassSummary::default();
        let mut join_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    warn!(error = %e, "segment worker did not finish");
                    join_error.get_or_insert(e);
                }
            }
        }
        match join_error {
            Some(e) => Err(DownloadError::Join(e)),
            None => Ok(summary),
        }
    }

    #[instrument(skip(self, segment), fields(segment = segment.index))]
    async fn run_segment(&self, segment: Segment) -> SegmentOutcome {
        let _permit = tokio::select! {
            permit = self.semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return SegmentOutcome::Cancelled,
            },
            _ = self.cancel.cancelled() => return SegmentOutcome::Cancelled,
        };

        if self.store.status(segment.index).await == Some(SegmentStatus::Completed) {
            return SegmentOutcome::Skipped;
        }

        let counter = Arc::new(AtomicU64::new(0));
        self.stats.start(segment.index, counter.clone());

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.fetch_into_file(&segment, &counter) => result,
        };

        let outcome = match result {
            Ok(written) => {
                debug!(start = segment.start, end = segment.end, written, "segment completed");
                self.record(segment.index, SegmentStatus::Completed).await;
                SegmentOutcome::Completed
            }
            Err(FetchError::Cancelled) => {
                debug!("segment cancelled, left pending");
                SegmentOutcome::Cancelled
            }
            Err(e) => {
                warn!(start = segment.start, end = segment.end, error = %e, "segment failed");
                self.record(segment.index, SegmentStatus::Failed).await;
                SegmentOutcome::Failed
            }
        };
        self.stats.finish(segment.index, outcome == SegmentOutcome::Completed);
        outcome
    }

    async fn record(&self, index: usize, status: SegmentStatus) {
        if let Err(e) = self.store.transition(index, status).await {
            warn!(
                path = %self.store.path().display(),
                error = %e,
                "could not persist resume state"
            );
        }
    }

    /// Streams one segment into the destination and returns the bytes written.
    async fn fetch_into_file(&self, segment: &Segment, counter: &AtomicU64) -> Result<u64, FetchError> {
        let range = self.ranged.then_some(ByteRange {
            start: segment.start,
            end: segment.end,
        });
        let mut body = self.source.fetch(range).await?;

        let mut offset = segment.start;
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            let len = chunk.len() as u64;
            if self.ranged && written + len > segment.len() {
                return Err(FetchError::RangeIgnored {
                    expected: segment.len(),
                    received: written + len,
                });
            }
            if let Some(throttle) = &self.throttle {
                throttle.acquire(len).await;
            }
            write_at(self.file.clone(), chunk, offset).await?;
            offset += len;
            written += len;
            counter.store(written, Ordering::Release);
        }

        let expected = if self.ranged {
            Some(segment.len())
        } else {
            self.expected_single
        };
        match expected {
            Some(expected) if written != expected => {
                return Err(FetchError::ShortWrite { expected, written });
            }
            None if written == 0 => {
                return Err(FetchError::ShortWrite {
                    expected: 1,
                    written,
                });
            }
            _ => {}
        }

        let file = self.file.clone();
        let ranged = self.ranged;
        tokio::task::spawn_blocking(move || {
            if !ranged {
                file.set_len(written)?;
            }
            file.sync_data()
        })
        .await
        .map_err(std::io::Error::other)??;

        Ok(written)
    }
}

async fn write_at(file: Arc<File>, data: Bytes, offset: u64) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset))
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::io::{Error, ErrorKind};
    use std::os::windows::fs::FileExt;

    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => return Err(Error::new(ErrorKind::WriteZero, "failed to write whole buffer")),
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
