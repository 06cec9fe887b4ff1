//! Error types for segment fetches and whole downloads.
//!
//! [`FetchError`] is local to one segment: it is recorded on the segment as
//! Failed and never aborts sibling workers. [`DownloadError`] is what the
//! orchestrator surfaces to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that fail a single segment.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure (DNS, connect, TLS, body read).
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Response status outside 200..300.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    /// The server sent more bytes than the requested range holds.
    #[error("range ignored by server: expected {expected} bytes, received at least {received}")]
    RangeIgnored { expected: u64, received: u64 },

    /// The body ended before the segment was filled.
    #[error("short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: u64, written: u64 },

    /// Positional write into the destination failed.
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Any other source-specific failure (used by non-HTTP sources).
    #[error("{0}")]
    Other(String),

    /// The transfer was cancelled while this segment was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }
}

/// Errors surfaced by [`Downloader::download`](crate::Downloader::download).
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The destination directory or file could not be created or opened.
    #[error("cannot create destination {path}: {source}")]
    CreateDestination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every attempt ended with unfinished segments.
    #[error(
        "maximum download retries exceeded for {url} after {attempts} attempts ({failed} failed, {pending} pending segments)"
    )]
    RetriesExhausted {
        url: String,
        attempts: u32,
        failed: usize,
        pending: usize,
    },

    /// The transfer was cancelled; the sidecar keeps partial progress.
    #[error("download cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DownloadError {
    pub fn create_destination(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CreateDestination {
            path: path.into(),
            source,
        }
    }

    /// True for the distinct "retries exhausted" condition.
    #[must_use]
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_display() {
        let error = FetchError::http_status("http://example.com/a.bin", 503);
        let msg = error.to_string();
        assert!(msg.contains("503"), "Expected status in: {msg}");
        assert!(msg.contains("http://example.com/a.bin"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_short_write_display() {
        let error = FetchError::ShortWrite {
            expected: 10,
            written: 4,
        };
        assert_eq!(error.to_string(), "short write: expected 10 bytes, wrote 4");
    }

    #[test]
    fn test_retries_exhausted_is_distinct() {
        let error = DownloadError::RetriesExhausted {
            url: "http://example.com/a.bin".to_string(),
            attempts: 3,
            failed: 2,
            pending: 0,
        };
        assert!(error.is_retries_exhausted());
        assert!(error.to_string().contains("maximum download retries exceeded"));
        assert!(!DownloadError::Cancelled.is_retries_exhausted());
    }

    #[test]
    fn test_create_destination_keeps_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = DownloadError::create_destination("/readonly/file.bin", io);
        assert!(error.to_string().contains("/readonly/file.bin"));
    }
}
