//! Progress aggregation.
//!
//! One task owns every piece of live-transfer state. Workers never touch
//! shared totals: they announce a segment with its byte counter and later
//! announce that it finished. The aggregator samples the counters on a timer
//! and turns them into [`TransferSnapshot`]s.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::HumanBytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
pub enum StatsEvent {
    /// A worker began streaming a segment; `counter` is its live byte count.
    Start {
        index: usize,
        counter: Arc<AtomicU64>,
    },
    /// A worker is done with a segment. Only completed segments count.
    Finish { index: usize, completed: bool },
    Stop,
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub filename: String,
    pub total_size: u64,
    pub transferred: u64,
    pub elapsed: Duration,
    /// 0.0 to 100.0
    pub percent: f64,
    pub segments_completed: usize,
    pub segments_total: usize,
    pub bytes_per_second: f64,
}

impl fmt::Display for TransferSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} / {} ({:.2}%) segments {}/{} {}/s",
            self.filename,
            HumanBytes(self.transferred),
            HumanBytes(self.total_size),
            self.percent,
            self.segments_completed,
            self.segments_total,
            HumanBytes(self.bytes_per_second as u64)
        )
    }
}

/// Cheap cloneable sender used by workers. Disabled stats make every call a
/// no-op.
#[derive(Debug, Clone, Default)]
pub struct StatsReporter {
    tx: Option<mpsc::UnboundedSender<StatsEvent>>,
}

impl StatsReporter {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn start(&self, index: usize, counter: Arc<AtomicU64>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StatsEvent::Start { index, counter });
        }
    }

    pub fn finish(&self, index: usize, completed: bool) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StatsEvent::Finish { index, completed });
        }
    }
}

/// Running aggregator: hand out reporters, then [`stop`](Self::stop) once the
/// worker pool has drained.
#[derive(Debug)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<StatsEvent>,
    join: JoinHandle<TransferSnapshot>,
}

impl StatsHandle {
    pub fn reporter(&self) -> StatsReporter {
        StatsReporter {
            tx: Some(self.tx.clone()),
        }
    }

    /// Sends the stop event and waits for the final snapshot. Must only be
    /// called after every worker has sent its last event.
    pub async fn stop(self) -> Result<TransferSnapshot, tokio::task::JoinError> {
        let _ = self.tx.send(StatsEvent::Stop);
        self.join.await
    }
}

#[derive(Debug)]
pub struct StatsAggregator {
    filename: String,
    total_size: u64,
    segments_total: usize,
    segments_completed: usize,
    /// Bytes of segments completed before this run started.
    resumed_bytes: u64,
    /// Bytes of segments completed during this run.
    finished_bytes: u64,
    live: HashMap<usize, Arc<AtomicU64>>,
    started: Instant,
    sink: Option<mpsc::UnboundedSender<TransferSnapshot>>,
}

impl StatsAggregator {
    pub fn new(
        filename: impl Into<String>,
        total_size: u64,
        segments_total: usize,
        segments_completed: usize,
        resumed_bytes: u64,
    ) -> Self {
        Self {
            filename: filename.into(),
            total_size,
            segments_total,
            segments_completed,
            resumed_bytes,
            finished_bytes: 0,
            live: HashMap::new(),
            started: Instant::now(),
            sink: None,
        }
    }

    /// Also deliver every snapshot to `sink`.
    pub fn with_sink(mut self, sink: Option<mpsc::UnboundedSender<TransferSnapshot>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn handle(&mut self, event: StatsEvent) {
        match event {
            StatsEvent::Start { index, counter } => {
                self.live.insert(index, counter);
            }
            StatsEvent::Finish { index, completed } => {
                if let Some(counter) = self.live.remove(&index) {
                    if completed {
                        self.finished_bytes += counter.load(Ordering::Acquire);
                    }
                }
                if completed {
                    self.segments_completed += 1;
                }
            }
            StatsEvent::Stop => {}
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        let live: u64 = self
            .live
            .values()
            .map(|counter| counter.load(Ordering::Acquire))
            .sum();
        let fetched = self.finished_bytes + live;
        let transferred = self.resumed_bytes + fetched;

        let elapsed = self.started.elapsed();
        let seconds = elapsed.as_secs_f64().max(1.0);
        let percent = if self.total_size == 0 {
            0.0
        } else {
            transferred as f64 / self.total_size as f64 * 100.0
        };

        TransferSnapshot {
            filename: self.filename.clone(),
            total_size: self.total_size,
            transferred,
            elapsed,
            percent,
            segments_completed: self.segments_completed,
            segments_total: self.segments_total,
            bytes_per_second: fetched as f64 / seconds,
        }
    }

    fn emit(&self) -> TransferSnapshot {
        let snapshot = self.snapshot();
        debug!(
            transferred = snapshot.transferred,
            total = snapshot.total_size,
            segments = snapshot.segments_completed,
            bytes_per_second = snapshot.bytes_per_second as u64,
            "{snapshot}"
        );
        if let Some(sink) = &self.sink {
            let _ = sink.send(snapshot.clone());
        }
        snapshot
    }

    /// Moves the aggregator onto its own task.
    pub fn spawn(mut self, interval: Duration, cancel: CancellationToken) -> StatsHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(async move {
            self.started = Instant::now();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(StatsEvent::Stop) | None => break,
                        Some(event) => self.handle(event),
                    },
                    _ = ticker.tick() => {
                        self.emit();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            self.emit()
        });
        StatsHandle { tx, join }
    }
}
