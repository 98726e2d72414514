//! `reqwest` transport for tabpulse.
//!
//! Batches are POSTed as a JSON array; the status probe is a plain GET. Both
//! carry the tenant and routing headers. No retries here: the dispatcher
//! and the retry layer decide what to do with a failure.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tabpulse_http::HttpTransport;
//!
//! let transport = Arc::new(HttpTransport::with_timeout(Duration::from_secs(10))?);
//! let pipeline = PipelineBuilder::new(store, transport, policy).build()?;
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tabpulse::{CollectorHeaders, Transport, TransportRecord, TransportResponse};
use tracing::debug;

/// Timeout used by [`HttpTransport::new`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Collector transport over HTTP(S).
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Client whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tabpulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared connection pool, custom TLS, ...).
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Collector credentials as request headers.
pub fn header_map(headers: &CollectorHeaders) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(2);
    for (name, value) in headers.pairs() {
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("{name} is not a valid header value"))?;
        map.insert(HeaderName::from_static(name), value);
    }
    Ok(map)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        headers: &CollectorHeaders,
        body: &[TransportRecord],
    ) -> Result<TransportResponse> {
        let response = self
            .client
            .post(url)
            .headers(header_map(headers)?)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status().as_u16();
        debug!(url, records = body.len(), status, "batch posted");
        Ok(TransportResponse::new(status))
    }

    async fn probe(&self, url: &str, headers: &CollectorHeaders) -> Result<TransportResponse> {
        let response = self
            .client
            .get(url)
            .headers(header_map(headers)?)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        Ok(TransportResponse::new(response.status().as_u16()))
    }
}
