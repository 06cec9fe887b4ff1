//! Resumable segmented downloads.
//!
//! A resource is split into byte-range segments that are fetched concurrently
//! and written straight to their offsets in the destination file. Segment
//! completion is recorded in a JSON sidecar next to the file, so an
//! interrupted or partly failed transfer picks up where it stopped.
//!
//! ```no_run
//! use segdl::{Config, Downloader};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), segdl::DownloadError> {
//! let config = Config::default().with_concurrency(8);
//! let report = Downloader::new(config)
//!     .download(Path::new("downloads"), "https://example.com/big.iso")
//!     .await?;
//! println!("{} bytes in {} attempts", report.bytes, report.attempts);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod downloader;
pub mod error;
pub mod planner;
pub mod pool;
pub mod source;
pub mod state;
pub mod stats;
pub mod utils;

pub use config::{Config, ReconcilePolicy, SidecarPolicy};
pub use downloader::{DownloadReport, Downloader};
pub use error::{DownloadError, FetchError};
pub use planner::plan_segments;
pub use source::{ByteRange, ByteStream, HttpSource, ResourceInfo, Source};
pub use state::{ResumeState, Segment, SegmentStatus};
pub use stats::TransferSnapshot;
