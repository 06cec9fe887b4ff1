//! Resume state and its sidecar.
//!
//! The sidecar is a JSON file next to the destination. It is only ever written
//! through [`ResumeStore`], which holds the state behind one async mutex and
//! persists after every segment transition, so writes are serialized and each
//! one happens after the transition that caused it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{Config, ReconcilePolicy};
use crate::planner::{completed_bytes, plan_segments, validate_cover};

/// Suffix appended to the destination file name to derive the sidecar.
pub const SIDECAR_SUFFIX: &str = ".segdl.json";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Completed,
    Failed,
}

/// One byte range `[start, end]` (inclusive) of the resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            status: SegmentStatus::Pending,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_completed(&self) -> bool {
        self.status == SegmentStatus::Completed
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResumeState {
    pub url: String,
    /// Length reported by the probe, if any.
    pub content_length: Option<u64>,
    pub segments: Vec<Segment>,
    pub completed: usize,
    pub failed: usize,
    pub all_complete: bool,
    pub config: Config,
    pub updated_at: DateTime<Utc>,
}

impl ResumeState {
    /// A fresh state with every segment Pending.
    pub fn new(url: &str, content_length: Option<u64>, accepts_ranges: bool, config: Config) -> Self {
        let segments = plan_segments(content_length, accepts_ranges, config.segment_size);
        Self {
            url: url.to_string(),
            content_length,
            segments,
            completed: 0,
            failed: 0,
            all_complete: false,
            config,
            updated_at: Utc::now(),
        }
    }

    /// Length covered by the plan (unknown lengths count as one byte).
    pub fn planned_length(&self) -> u64 {
        self.content_length.unwrap_or(1).max(1)
    }

    pub fn is_multi_segment(&self) -> bool {
        self.segments.len() > 1
    }

    pub fn pending(&self) -> usize {
        self.segments.len() - self.completed - self.failed
    }

    pub fn completed_bytes(&self) -> u64 {
        completed_bytes(&self.segments)
    }

    pub fn every_segment_completed(&self) -> bool {
        self.segments.iter().all(Segment::is_completed)
    }

    /// Moves one segment to `status`, keeping the counters in step.
    pub fn transition(&mut self, index: usize, status: SegmentStatus) {
        let Some(segment) = self.segments.get_mut(index) else {
            return;
        };
        let previous = segment.status;
        if previous == status {
            return;
        }
        segment.status = status;
        match previous {
            SegmentStatus::Completed => self.completed -= 1,
            SegmentStatus::Failed => self.failed -= 1,
            SegmentStatus::Pending => {}
        }
        match status {
            SegmentStatus::Completed => self.completed += 1,
            SegmentStatus::Failed => self.failed += 1,
            SegmentStatus::Pending => {}
        }
        self.all_complete = self.completed == self.segments.len();
    }

    /// Structural check applied to anything read back from disk.
    fn is_consistent(&self) -> bool {
        let completed = self.segments.iter().filter(|s| s.is_completed()).count();
        let failed = self
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Failed)
            .count();
        validate_cover(&self.segments, self.planned_length())
            && completed == self.completed
            && failed == self.failed
    }
}

/// Sidecar path for a destination file: `<name>.segdl.json` in the same
/// directory.
pub fn sidecar_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SIDECAR_SUFFIX);
    destination.with_file_name(name)
}

/// Reads a sidecar. Absence and any read or parse failure yield `None`.
pub async fn load(path: &Path) -> Option<ResumeState> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable resume sidecar, starting fresh");
            return None;
        }
    };
    match serde_json::from_str::<ResumeState>(&content) {
        Ok(state) if state.is_consistent() => Some(state),
        Ok(_) => {
            warn!(path = %path.display(), "inconsistent resume sidecar, starting fresh");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt resume sidecar, starting fresh");
            None
        }
    }
}

/// Writes the whole state to `<path>.tmp` and renames it over `path`.
pub async fn save(state: &ResumeState, path: &Path) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(state)?;
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(&tmp_path)
        .await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path).await
}

/// Deletes a sidecar; a missing file is not an error.
pub async fn remove(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Picks the configuration for this run.
///
/// With a stored state the stored segment size and concurrency win so the
/// stored segments stay valid. Without one the request is used as is.
pub fn reconcile(loaded: Option<&ResumeState>, requested: &Config) -> Config {
    match loaded {
        Some(state) => requested.clone().adopt_plan_fields(&state.config),
        None => requested.clone(),
    }
}

/// Decides whether a stored state may be resumed for this request.
///
/// A state is dropped when it belongs to another URL, when the probe reports a
/// different length, when an unsized plan with no finished segment could now
/// be planned properly, or (under [`ReconcilePolicy::Replan`]) when the requested
/// segment size differs from the stored one.
pub fn usable_for(state: &ResumeState, url: &str, probed_length: Option<u64>, requested: &Config) -> bool {
    if state.url != url {
        debug!(stored = %state.url, requested = %url, "resume state belongs to another URL");
        return false;
    }
    if let (Some(probed), Some(stored)) = (probed_length, state.content_length) {
        if probed != stored {
            debug!(probed, stored, "resource length changed since the plan was made");
            return false;
        }
    }
    if state.content_length.is_none() && probed_length.is_some() && state.completed == 0 {
        debug!(probed = ?probed_length, "length is known now, replacing the unsized plan");
        return false;
    }
    if requested.reconcile == ReconcilePolicy::Replan
        && state.config.segment_size != requested.segment_size
    {
        debug!(
            stored = state.config.segment_size,
            requested = requested.segment_size,
            "segment size changed, replanning"
        );
        return false;
    }
    true
}

/// Single-writer handle over the resume state and its sidecar.
#[derive(Debug)]
pub struct ResumeStore {
    path: PathBuf,
    state: Mutex<ResumeState>,
}

impl ResumeStore {
    pub fn new(state: ResumeState, path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn status(&self, index: usize) -> Option<SegmentStatus> {
        self.state.lock().await.segments.get(index).map(|s| s.status)
    }

    /// Applies one transition and persists while the lock is held.
    pub async fn transition(&self, index: usize, status: SegmentStatus) -> std::io::Result<()> {
        let mut state = self.state.lock().await;
        state.transition(index, status);
        state.updated_at = Utc::now();
        save(&state, &self.path).await
    }

    /// Persists the current state as is.
    pub async fn persist(&self) -> std::io::Result<()> {
        let mut state = self.state.lock().await;
        state.updated_at = Utc::now();
        save(&state, &self.path).await
    }

    /// Marks the state complete and persists it.
    pub async fn finish(&self) -> std::io::Result<()> {
        let mut state = self.state.lock().await;
        state.all_complete = true;
        state.updated_at = Utc::now();
        save(&state, &self.path).await
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> ResumeState {
        self.state.lock().await.clone()
    }

    pub fn into_inner(self) -> ResumeState {
        self.state.into_inner()
    }
}
