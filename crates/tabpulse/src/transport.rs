//! Outbound transport collaborator.

use anyhow::Result;
use async_trait::async_trait;

use crate::filter::TransportRecord;

/// Header carrying the tenant identifier.
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Header carrying the routing identifier.
pub const TOKEN_HEADER: &str = "x-routing-token";

/// Credentials attached to every collector request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorHeaders {
    pub tenant: String,
    pub token: String,
}

impl CollectorHeaders {
    pub fn pairs(&self) -> [(&'static str, &str); 2] {
        [(TENANT_HEADER, &self.tenant), (TOKEN_HEADER, &self.token)]
    }
}

/// What the collector answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self { status }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A single request/response primitive. Implementations must not retry or
/// batch; `Err` means the request never produced a response.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// POST a JSON array of records.
    async fn send(
        &self,
        url: &str,
        headers: &CollectorHeaders,
        body: &[TransportRecord],
    ) -> Result<TransportResponse>;

    /// GET a status endpoint.
    async fn probe(&self, url: &str, headers: &CollectorHeaders) -> Result<TransportResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(
        &self,
        url: &str,
        headers: &CollectorHeaders,
        body: &[TransportRecord],
    ) -> Result<TransportResponse> {
        (**self).send(url, headers, body).await
    }

    async fn probe(&self, url: &str, headers: &CollectorHeaders) -> Result<TransportResponse> {
        (**self).probe(url, headers).await
    }
}
