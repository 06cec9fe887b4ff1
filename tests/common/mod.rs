#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use segdl::{ByteRange, ByteStream, FetchError, ResourceInfo, Source};
use sha2::{Digest, Sha256};
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic pseudo-random payload.
pub fn payload(len: usize) -> Vec<u8> {
    let mut x: u64 = 0x9E37_79B9_7F4A_7C15 ^ len as u64;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x & 0xFF) as u8
        })
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn file_hash(path: &Path) -> String {
    sha256_hex(&std::fs::read(path).unwrap())
}

/// Serves `Range: bytes=a-b` with 206 and the slice, anything else with the
/// whole body.
pub struct RangeResponder {
    pub body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        match range {
            Some((start, end)) if end < self.body.len() && start <= end => {
                ResponseTemplate::new(206).set_body_bytes(self.body[start..=end].to_vec())
            }
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// In-memory [`Source`] with failure injection and in-flight accounting.
pub struct MemorySource {
    body: Vec<u8>,
    accepts_ranges: bool,
    chunk: usize,
    delay: Duration,
    /// Range starts whose next fetch fails.
    fail_once: Mutex<HashSet<u64>>,
    /// Range starts that always fail.
    fail_always: HashSet<u64>,
    /// Serve the whole body even when a range is asked for.
    ignore_ranges: bool,
    /// Number of upcoming probes that fail.
    probe_failures: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
    fetches: Mutex<Vec<Option<ByteRange>>>,
}

impl MemorySource {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            accepts_ranges: true,
            chunk: 7,
            delay: Duration::ZERO,
            fail_once: Mutex::new(HashSet::new()),
            fail_always: HashSet::new(),
            ignore_ranges: false,
            probe_failures: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: AtomicUsize::new(0),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accepts_ranges = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_once(self, starts: impl IntoIterator<Item = u64>) -> Self {
        self.fail_once.lock().unwrap().extend(starts);
        self
    }

    pub fn failing_always(mut self, starts: impl IntoIterator<Item = u64>) -> Self {
        self.fail_always.extend(starts);
        self
    }

    pub fn failing_probes(self, count: usize) -> Self {
        self.probe_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn ignoring_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    pub fn fetches(&self) -> Vec<Option<ByteRange>> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetched_starts(&self) -> Vec<u64> {
        let mut starts: Vec<u64> = self
            .fetches()
            .into_iter()
            .map(|r| r.map_or(0, |r| r.start))
            .collect();
        starts.sort_unstable();
        starts
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MemorySource {
    fn url(&self) -> &str {
        "memory://payload.bin"
    }

    async fn probe(&self) -> Result<ResourceInfo, FetchError> {
        let failing = self
            .probe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FetchError::Other("injected probe failure".to_string()));
        }
        Ok(ResourceInfo {
            length: Some(self.body.len() as u64),
            accepts_ranges: self.accepts_ranges,
        })
    }

    async fn fetch(&self, range: Option<ByteRange>) -> Result<ByteStream, FetchError> {
        self.fetches.lock().unwrap().push(range);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Counted until the body stream is dropped, not just until it opens.
        let guard = InFlightGuard(self.in_flight.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let start = range.map_or(0, |r| r.start);
        if self.fail_always.contains(&start) || self.fail_once.lock().unwrap().remove(&start) {
            return Err(FetchError::Other(format!("injected failure at {start}")));
        }

        let slice = match range {
            Some(r) if !self.ignore_ranges => self.body[r.start as usize..=r.end as usize].to_vec(),
            _ => self.body.clone(),
        };
        let chunks: Vec<Result<Bytes, FetchError>> = slice
            .chunks(self.chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks)
            .map(move |chunk| {
                let _held = &guard;
                chunk
            })
            .boxed())
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
