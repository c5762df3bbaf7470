//! Error types for the fetch capability.
//!
//! Errors carry the URL they relate to so retry logs and page diagnostics
//! stay readable without extra context plumbing.

use std::time::Duration;

use thiserror::Error;

use super::rate_limiter::parse_retry_after;

/// Errors produced while fetching a remote resource.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Connection-level failure (DNS, refused, reset, TLS, broken body stream).
    #[error("network error fetching {url}: {message}")]
    Network {
        /// The URL that failed.
        url: String,
        /// Transport error description.
        message: String,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Raw Retry-After header value, if the server sent one.
        retry_after: Option<String>,
    },

    /// The URL could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The response body exceeded the configured size cap.
    #[error("response from {url} exceeds {limit} bytes")]
    BodyTooLarge {
        /// The URL whose body was too large.
        url: String,
        /// The byte cap that was exceeded.
        limit: u64,
    },

    /// The fetch was abandoned because its job was cancelled.
    #[error("fetch of {url} cancelled")]
    Cancelled {
        /// The URL whose fetch was abandoned.
        url: String,
    },
}

impl FetchError {
    /// Creates a network error.
    #[must_use]
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    #[must_use]
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    #[must_use]
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an invalid URL error.
    #[must_use]
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns the server-mandated delay, if the error carried a parseable Retry-After.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus {
                retry_after: Some(value),
                ..
            } => parse_retry_after(value),
            _ => None,
        }
    }

    /// Returns true when the error came from cancellation rather than the remote side.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The URL the error relates to.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Network { url, .. }
            | Self::Timeout { url }
            | Self::HttpStatus { url, .. }
            | Self::InvalidUrl { url }
            | Self::BodyTooLarge { url, .. }
            | Self::Cancelled { url } => url,
        }
    }

    /// Returns the HTTP status for status errors.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
