//! Injected fetch capability.
//!
//! The core never talks to a transport directly: adapters, page workers and
//! the tile engine all go through a [`Fetcher`], which maps a URL plus
//! [`FetchOptions`] to a [`FetchResponse`] (`status`, `headers`, `body`).
//! Non-success statuses are ordinary responses; callers decide what they
//! mean via [`FetchResponse::error_for_status`] and [`classify_error`].
//!
//! [`HttpFetcher`] is the production implementation on top of reqwest, with
//! per-host pacing from [`RateLimiter`]. Tests substitute scripted fetchers.

mod client;
mod constants;
mod error;
pub mod rate_limiter;
pub mod retry;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use client::HttpFetcher;
pub use constants::{CONNECT_TIMEOUT_SECS, MAX_BODY_BYTES, READ_TIMEOUT_SECS};
pub use error::FetchError;
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    fetch_with_retry,
};

/// Per-request options understood by every [`Fetcher`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Extra request headers, applied in order.
    pub headers: Vec<(String, String)>,
    /// Per-request timeout overriding the client default.
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lowercased names.
    pub headers: HashMap<String, String>,
    /// Full response body.
    pub body: Bytes,
}

impl FetchResponse {
    /// Builds a response; header names are lowercased.
    #[must_use]
    pub fn new(status: u16, headers: HashMap<String, String>, body: impl Into<Bytes>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Converts non-2xx responses into [`FetchError::HttpStatus`].
    ///
    /// # Errors
    ///
    /// Returns `HttpStatus` carrying any `Retry-After` header when the status is not 2xx.
    pub fn error_for_status(self, url: &str) -> Result<Self, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::http_status_with_retry_after(
                url,
                self.status,
                self.header("retry-after").map(str::to_string),
            ))
        }
    }
}

/// Transport capability: `fetch(url, options) -> {status, headers, body}`.
#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
    /// Performs a GET request.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for transport failures only; HTTP error statuses
    /// are reported through [`FetchResponse::status`].
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError>;
}
