//! HTTP client wrapper for candidate and listing requests.
//!
//! One [`HttpClient`] is built per pipeline and cloned into every worker; the
//! clones share reqwest's connection pool.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::CONTENT_LENGTH;
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_MAX_PAYLOAD_BYTES, REQUEST_TIMEOUT_SECS};
use super::error::FetchError;
use crate::config::PipelineConfig;
use crate::user_agent::default_user_agent;

/// A fully read HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body. Left empty for non-2xx responses.
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Shared HTTP client with bounded timeouts and a body size cap.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    max_body_bytes: u64,
}

impl HttpClient {
    /// Creates a client with explicit limits.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] if reqwest rejects the configuration.
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        max_body_bytes: u64,
        user_agent: &str,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .gzip(true)
            .user_agent(user_agent)
            .build()
            .map_err(FetchError::ClientBuild)?;
        Ok(Self {
            client,
            max_body_bytes,
        })
    }

    /// Creates a client with the default limits.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] if reqwest rejects the configuration.
    pub fn with_defaults() -> Result<Self, FetchError> {
        Self::new(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
            DEFAULT_MAX_PAYLOAD_BYTES,
            &default_user_agent(),
        )
    }

    /// Creates a client from pipeline settings.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] if reqwest rejects the configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, FetchError> {
        Self::new(
            config.connect_timeout,
            config.request_timeout,
            config.max_payload_bytes,
            &config.user_agent,
        )
    }

    /// Issues one GET and reads the body of a 2xx response, streaming it
    /// against the size cap.
    ///
    /// Non-2xx responses are returned with an empty body; callers decide what
    /// the status means.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Timeout`] or [`FetchError::Network`] on transport
    /// failure and [`FetchError::BodyTooLarge`] when the cap is exceeded.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            debug!(status, "non-success status");
            return Ok(HttpResponse {
                status,
                body: Vec::new(),
            });
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes) {
            return Err(FetchError::BodyTooLarge {
                url: url.to_string(),
                limit: self.max_body_bytes,
            });
        }

        let capacity = declared
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(0);
        let mut body = Vec::with_capacity(capacity);
        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| FetchError::from_reqwest(url, e))?;
            if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge {
                    url: url.to_string(),
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(status, bytes = body.len(), "response read");
        Ok(HttpResponse { status, body })
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}
