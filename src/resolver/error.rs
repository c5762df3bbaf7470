//! Error types for manifest resolution.
//!
//! Messages follow the What/Why/Fix pattern used across the project: every
//! variant renders a `Suggestion:` line telling the user what to do next.

use thiserror::Error;

use crate::fetch::{FailureType, FetchError, classify_error};

/// Errors produced while turning a source URL into a [`Manifest`](crate::manifest::Manifest).
///
/// `Clone` so a single coalesced resolution can hand the same error to every waiter.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// No registered adapter recognizes the URL.
    #[error("unsupported source '{url}': no adapter recognizes this URL\n  Suggestion: {suggestion}")]
    UnsupportedSource {
        /// The submitted URL
        url: String,
        /// How to fix the issue
        suggestion: String,
    },

    /// Fetching the manifest or viewer page failed after retries.
    #[error("[{adapter}] could not fetch '{url}': {message}\n  Suggestion: Check your connection and retry the item later")]
    TransientFetch {
        /// Adapter that was resolving
        adapter: String,
        /// URL being fetched
        url: String,
        /// Underlying fetch failure
        message: String,
    },

    /// The host answered, but the document could not be turned into pages.
    #[error("[{adapter}] unexpected manifest format: {message}\n  Suggestion: {suggestion}")]
    PermanentFormat {
        /// Adapter that was resolving
        adapter: String,
        /// What was wrong with the document
        message: String,
        /// How to fix the issue
        suggestion: String,
    },
}

impl ResolveError {
    /// Creates an `UnsupportedSource` error.
    #[must_use]
    pub fn unsupported_source(url: &str) -> Self {
        Self::UnsupportedSource {
            url: url.to_string(),
            suggestion: "Use a viewer or IIIF manifest URL from a supported library".to_string(),
        }
    }

    /// Creates a `TransientFetch` error.
    #[must_use]
    pub fn transient_fetch(adapter: &str, url: &str, message: &str) -> Self {
        Self::TransientFetch {
            adapter: adapter.to_string(),
            url: url.to_string(),
            message: message.to_string(),
        }
    }

    /// Creates a `PermanentFormat` error.
    #[must_use]
    pub fn permanent_format(adapter: &str, message: &str) -> Self {
        Self::PermanentFormat {
            adapter: adapter.to_string(),
            message: message.to_string(),
            suggestion: "The library may have changed its page layout; check the URL in a browser"
                .to_string(),
        }
    }

    /// Maps a fetch failure that survived the retry loop.
    ///
    /// Permanent HTTP statuses (404, 410, ...) mean the document does not exist
    /// in the expected place, which no later retry will fix.
    #[must_use]
    pub fn from_fetch(adapter: &str, error: &FetchError) -> Self {
        match (classify_error(error), error) {
            (FailureType::Permanent, FetchError::HttpStatus { url, status, .. }) => {
                Self::permanent_format(adapter, &format!("'{url}' returned HTTP {status}"))
            }
            (_, error) => Self::transient_fetch(adapter, error.url(), &error.to_string()),
        }
    }

    /// True for errors that a later retry may fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }
}
