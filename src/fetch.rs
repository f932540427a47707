//! Network access for the worker
//!
//! All traffic the worker sends goes through the [`Fetcher`] trait, so the
//! router and the lifecycle manager can be driven against a real HTTP client
//! or an in-memory site.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use thiserror::Error;

use crate::request::{Request, Response};

/// Errors that can occur when going to the network
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed (DNS, connect, TLS, timeout, body read)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The network is not reachable at all
    #[error("network unavailable: {0}")]
    Offline(String),
}

/// Something that can satisfy a request from the network
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs the request and buffers the full response
    ///
    /// Any HTTP status counts as success here; only transport failures are
    /// errors. Callers decide what to do with non-2xx responses.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

impl std::fmt::Debug for dyn Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fetcher")
    }
}

/// Fetcher backed by a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher with the given User-Agent and per-request timeout
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let response = self
            .client
            .request(request.method().clone(), request.url().clone())
            .send()
            .await?;

        let status = response.status();
        let headers = header_pairs(response.headers());
        let body = response.bytes().await?;

        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

/// Flattens response headers, keeping values that are not visible ASCII
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Fetcher that never reaches the network
///
/// Used by `--offline` to exercise the fallback paths against a real cache
/// directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        Err(FetchError::Offline(request.url().to_string()))
    }
}
