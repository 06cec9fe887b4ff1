//! The download orchestrator.
//!
//! One attempt loads or creates the resume state, runs the worker pool over
//! every segment and inspects the result. Unfinished attempts are retried up
//! to `max_attempts` times; each retry resumes from the sidecar, so only
//! Failed and Pending segments are fetched again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, OpenOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, SidecarPolicy};
use crate::error::DownloadError;
use crate::pool::{Pool, Throttle};
use crate::source::{HttpSource, ResourceInfo, Source};
use crate::state::{self, ResumeState, ResumeStore};
use crate::stats::{StatsAggregator, StatsReporter, TransferSnapshot};
use crate::utils::filename_from_url;

/// What a successful download produced.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub sidecar: PathBuf,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    pub bytes: u64,
    pub segments: usize,
    /// True when some attempt started from a stored sidecar.
    pub resumed: bool,
    /// Last snapshot of the final attempt, when stats are enabled.
    pub last_snapshot: Option<TransferSnapshot>,
}

enum AttemptOutcome {
    Complete {
        state: ResumeState,
        resumed: bool,
        last_snapshot: Option<TransferSnapshot>,
    },
    Incomplete {
        failed: usize,
        pending: usize,
        resumed: bool,
    },
}

pub struct Downloader {
    config: Config,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<TransferSnapshot>>,
}

impl Downloader {
    pub fn new(config: Config) -> Self {
        Self {
            config: config.normalized(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Observe this token from outside; cancelling it stops the transfer and
    /// leaves the sidecar with whatever finished.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receive every progress snapshot (only produced when stats are enabled).
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<TransferSnapshot>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Downloads `url` over HTTP into `dir`, naming the file after the URL.
    pub async fn download(&self, dir: &Path, url: &str) -> Result<DownloadReport, DownloadError> {
        let source = HttpSource::new(url, self.config.connect_timeout, self.config.request_timeout);
        let destination = dir.join(filename_from_url(url));
        self.download_from(Arc::new(source), &destination).await
    }

    /// Downloads from any [`Source`] into `destination`.
    #[instrument(skip(self, source), fields(url = %source.url(), path = %destination.display()))]
    pub async fn download_from(
        &self,
        source: Arc<dyn Source>,
        destination: &Path,
    ) -> Result<DownloadReport, DownloadError> {
        let sidecar = state::sidecar_path(destination);
        let throttle = self.config.rate_limit.map(|limit| Arc::new(Throttle::per_second(limit)));
        let max_attempts = self.config.max_attempts;
        let mut resumed_any = false;

        info!(max_attempts, "download starting");
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .attempt(source.clone(), destination, &sidecar, throttle.clone())
                .await?;

            match outcome {
                AttemptOutcome::Complete {
                    state: finished,
                    resumed,
                    last_snapshot,
                } => {
                    resumed_any |= resumed;
                    if self.config.sidecar == SidecarPolicy::Remove {
                        if let Err(e) = state::remove(&sidecar).await {
                            warn!(path = %sidecar.display(), error = %e, "could not remove resume sidecar");
                        }
                    }
                    let bytes = fs::metadata(destination)
                        .await
                        .map(|m| m.len())
                        .unwrap_or_else(|_| finished.planned_length());
                    info!(attempt, bytes, segments = finished.segments.len(), "download complete");
                    return Ok(DownloadReport {
                        path: destination.to_path_buf(),
                        sidecar,
                        attempts: attempt,
                        bytes,
                        segments: finished.segments.len(),
                        resumed: resumed_any,
                        last_snapshot,
                    });
                }
                AttemptOutcome::Incomplete {
                    failed,
                    pending,
                    resumed,
                } => {
                    resumed_any |= resumed;
                    if attempt >= max_attempts {
                        warn!(attempt, failed, pending, "retries exhausted");
                        return Err(DownloadError::RetriesExhausted {
                            url: source.url().to_string(),
                            attempts: attempt,
                            failed,
                            pending,
                        });
                    }
                    warn!(
                        attempt,
                        failed,
                        pending,
                        remaining = max_attempts - attempt,
                        "attempt incomplete, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        source: Arc<dyn Source>,
        destination: &Path,
        sidecar: &Path,
        throttle: Option<Arc<Throttle>>,
    ) -> Result<AttemptOutcome, DownloadError> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::create_destination(parent, e))?;
        }

        let info = match source.probe().await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "probe failed, falling back to a single unranged request");
                ResourceInfo::default()
            }
        };

        let destination_exists = fs::try_exists(destination).await.unwrap_or(false);
        let loaded = state::load(sidecar).await.filter(|stored| {
            destination_exists && state::usable_for(stored, source.url(), info.length, &self.config)
        });
        let resumed = loaded.is_some();
        let effective = state::reconcile(loaded.as_ref(), &self.config);
        let plan = match loaded {
            Some(stored) => {
                info!(
                    completed = stored.completed,
                    total = stored.segments.len(),
                    segment_size = effective.segment_size,
                    "resuming from sidecar"
                );
                stored
            }
            None => {
                let fresh = ResumeState::new(source.url(), info.length, info.accepts_ranges, effective.clone());
                debug!(
                    length = ?info.length,
                    accepts_ranges = info.accepts_ranges,
                    segments = fresh.segments.len(),
                    "planned segments"
                );
                fresh
            }
        };

        let file = self.open_destination(destination, &plan).await?;

        let ranged = plan.is_multi_segment();
        let expected_single = plan.content_length;
        let segments = plan.segments.clone();
        let filename = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stats = effective.use_stats.then(|| {
            StatsAggregator::new(
                filename,
                plan.planned_length(),
                plan.segments.len(),
                plan.completed,
                plan.completed_bytes(),
            )
            .with_sink(self.progress.clone())
            .spawn(effective.stats_interval, self.cancel.child_token())
        });

        let store = Arc::new(ResumeStore::new(plan, sidecar.to_path_buf()));
        if let Err(e) = store.persist().await {
            warn!(path = %sidecar.display(), error = %e, "could not persist resume state");
        }

        let reporter = stats
            .as_ref()
            .map(|s| s.reporter())
            .unwrap_or_else(StatsReporter::disabled);
        let pool = Pool::new(
            source,
            file,
            store.clone(),
            reporter,
            throttle,
            effective.concurrency,
            self.cancel.clone(),
            ranged,
            expected_single,
        );
        let summary = pool.run(segments).await;

        // Every worker has returned, so no event can race the stop.
        let last_snapshot = match stats {
            Some(handle) => Some(handle.stop().await?),
            None => None,
        };
        let summary = summary?;
        debug!(?summary, "pass finished");

        if summary.cancelled > 0 || self.cancel.is_cancelled() {
            if let Err(e) = store.persist().await {
                warn!(path = %sidecar.display(), error = %e, "could not persist resume state");
            }
            return Err(DownloadError::Cancelled);
        }

        let current = store.snapshot().await;
        if current.every_segment_completed() {
            if let Err(e) = store.finish().await {
                warn!(path = %sidecar.display(), error = %e, "could not persist resume state");
            }
            return Ok(AttemptOutcome::Complete {
                state: store.snapshot().await,
                resumed,
                last_snapshot,
            });
        }

        if let Err(e) = store.persist().await {
            warn!(path = %sidecar.display(), error = %e, "could not persist resume state");
        }
        Ok(AttemptOutcome::Incomplete {
            failed: current.failed,
            pending: current.pending(),
            resumed,
        })
    }

    /// Opens the destination for positional writes. Multi-segment plans size
    /// the file to the resource length up front.
    async fn open_destination(
        &self,
        destination: &Path,
        state: &ResumeState,
    ) -> Result<Arc<std::fs::File>, DownloadError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(destination)
            .await
            .map_err(|e| DownloadError::create_destination(destination, e))?;

        if state.is_multi_segment() {
            let length = state.planned_length();
            let current = file
                .metadata()
                .await
                .map_err(|e| DownloadError::create_destination(destination, e))?
                .len();
            if current != length {
                file.set_len(length)
                    .await
                    .map_err(|e| DownloadError::create_destination(destination, e))?;
            }
        }

        Ok(Arc::new(file.into_std().await))
    }
}
