//! Download configuration.
//!
//! The fields that shape a plan (`segment_size`, `concurrency`, `max_attempts`,
//! `use_stats`) are persisted in the resume sidecar. Everything else is
//! runtime-only and always comes from the caller.

use std::num::NonZeroU32;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default segment size (4 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of segments fetched at once.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default number of orchestrator attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// What to do with a stored plan whose segment size differs from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePolicy {
    /// Keep the stored plan and its configuration.
    #[default]
    PreferStored,
    /// Drop the stored plan and start over with the requested configuration.
    Replan,
}

/// What happens to the sidecar once every segment is Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SidecarPolicy {
    #[default]
    Remove,
    /// Keep it, flagged `all_complete`, as a record of the transfer.
    Retain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub segment_size: u64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub use_stats: bool,

    #[serde(skip, default = "default_retry_delay")]
    pub retry_delay: Duration,
    #[serde(skip, default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(skip)]
    pub request_timeout: Option<Duration>,
    /// Global bandwidth cap in bytes per second shared by all workers.
    #[serde(skip)]
    pub rate_limit: Option<NonZeroU32>,
    #[serde(skip, default = "default_stats_interval")]
    pub stats_interval: Duration,
    #[serde(skip)]
    pub reconcile: ReconcilePolicy,
    #[serde(skip)]
    pub sidecar: SidecarPolicy,
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_stats_interval() -> Duration {
    DEFAULT_STATS_INTERVAL
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            use_stats: false,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            rate_limit: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
            reconcile: ReconcilePolicy::default(),
            sidecar: SidecarPolicy::default(),
        }
    }
}

impl Config {
    /// Clamps the numeric knobs to usable values.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.segment_size = self.segment_size.max(1);
        self.concurrency = self.concurrency.max(1);
        self.max_attempts = self.max_attempts.max(1);
        if self.stats_interval.is_zero() {
            self.stats_interval = DEFAULT_STATS_INTERVAL;
        }
        self
    }

    #[must_use]
    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_stats(mut self, use_stats: bool) -> Self {
        self.use_stats = use_stats;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, bytes_per_sec: Option<NonZeroU32>) -> Self {
        self.rate_limit = bytes_per_sec;
        self
    }

    #[must_use]
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    #[must_use]
    pub fn with_reconcile(mut self, policy: ReconcilePolicy) -> Self {
        self.reconcile = policy;
        self
    }

    #[must_use]
    pub fn with_sidecar(mut self, policy: SidecarPolicy) -> Self {
        self.sidecar = policy;
        self
    }

    /// Takes the plan-shaping fields from `stored`, keeping every runtime
    /// field of `self`.
    #[must_use]
    pub fn adopt_plan_fields(mut self, stored: &Config) -> Self {
        self.segment_size = stored.segment_size;
        self.concurrency = stored.concurrency;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.segment_size, 4_194_304);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.max_attempts, 10);
        assert!(!config.use_stats);
        assert_eq!(config.reconcile, ReconcilePolicy::PreferStored);
        assert_eq!(config.sidecar, SidecarPolicy::Remove);
    }

    #[test]
    fn test_normalized_clamps_zeroes() {
        let config = Config::default()
            .with_segment_size(0)
            .with_concurrency(0)
            .with_max_attempts(0)
            .with_stats_interval(Duration::ZERO)
            .normalized();
        assert_eq!(config.segment_size, 1);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.stats_interval, DEFAULT_STATS_INTERVAL);
    }

    #[test]
    fn test_runtime_fields_are_not_serialized() {
        let config = Config::default()
            .with_retry_delay(Duration::from_secs(30))
            .with_sidecar(SidecarPolicy::Retain);
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("retry_delay"));
        assert!(!json.contains("sidecar"));

        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(back.sidecar, SidecarPolicy::Remove);
        assert_eq!(back.segment_size, config.segment_size);
    }

    #[test]
    fn test_adopt_plan_fields_keeps_runtime_fields() {
        let stored = Config::default().with_segment_size(1024).with_concurrency(3);
        let requested = Config::default()
            .with_segment_size(4096)
            .with_concurrency(8)
            .with_max_attempts(2)
            .with_sidecar(SidecarPolicy::Retain);

        let effective = requested.adopt_plan_fields(&stored);
        assert_eq!(effective.segment_size, 1024);
        assert_eq!(effective.concurrency, 3);
        assert_eq!(effective.max_attempts, 2);
        assert_eq!(effective.sidecar, SidecarPolicy::Retain);
    }
}
