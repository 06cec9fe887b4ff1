//! Where segment bytes come from.
//!
//! The engine only talks to a [`Source`]. [`HttpSource`] is the real one: a
//! `HEAD` probe for size and range support, then one `GET` per segment.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::Client;
use tracing::{debug, instrument};

use crate::error::FetchError;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// What the probe learned about the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceInfo {
    /// Total size, when the server reported one.
    pub length: Option<u64>,
    pub accepts_ranges: bool,
}

/// An inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Human-readable location, used for logs and errors.
    fn url(&self) -> &str;

    /// Discovers length and range support.
    async fn probe(&self) -> Result<ResourceInfo, FetchError>;

    /// Opens the body of `range`, or of the whole resource when `range` is
    /// `None`. A non-2xx response is an error.
    async fn fetch(&self, range: Option<ByteRange>) -> Result<ByteStream, FetchError>;
}

/// [`Source`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, connect_timeout: Duration, request_timeout: Option<Duration>) -> Self {
        let mut builder = Client::builder()
            .user_agent(concat!("segdl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout);
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().unwrap_or_else(|_| Client::new());
        Self::with_client(client, url)
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Source for HttpSource {
    fn url(&self) -> &str {
        &self.url
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn probe(&self) -> Result<ResourceInfo, FetchError> {
        let response = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| FetchError::network(&self.url, e))?;

        // Read the header itself: the body of a HEAD response is always empty.
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let accepts_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("bytes"));

        debug!(?length, accepts_ranges, status = response.status().as_u16(), "probed resource");
        Ok(ResourceInfo {
            length,
            accepts_ranges,
        })
    }

    async fn fetch(&self, range: Option<ByteRange>) -> Result<ByteStream, FetchError> {
        let mut request = self.client.get(&self.url);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::network(&self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::http_status(&self.url, status.as_u16()));
        }

        let url = self.url.clone();
        Ok(response
            .bytes_stream()
            .map_err(move |e| FetchError::network(url.clone(), e))
            .boxed())
    }
}
