//! Error types for queue orchestration.

use thiserror::Error;

use crate::queue::{ItemState, QueueError};
use crate::resolver::ResolveError;

/// Minimum page concurrency.
pub const MIN_CONCURRENCY: usize = 1;
/// Maximum page concurrency.
pub const MAX_CONCURRENCY: usize = 32;

/// Errors returned by [`super::Orchestrator`] operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The operation is not allowed in the item's current state.
    #[error(
        "cannot {operation} item {id} while it is {state}\n  Suggestion: pause the queue or wait for the item to finish first"
    )]
    InvalidState {
        id: i64,
        state: ItemState,
        operation: &'static str,
    },

    /// Options failed validation.
    #[error("invalid options: {message}")]
    InvalidOptions { message: String },

    /// Concurrency outside the supported range.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency { value: usize },

    /// The URL could not be routed to an adapter.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Queue persistence failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A scheduling semaphore was closed.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

impl OrchestratorError {
    #[must_use]
    pub fn invalid_state(id: i64, state: ItemState, operation: &'static str) -> Self {
        Self::InvalidState {
            id,
            state,
            operation,
        }
    }

    #[must_use]
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            message: message.into(),
        }
    }
}

/// Rejects concurrency values outside [`MIN_CONCURRENCY`]..=[`MAX_CONCURRENCY`].
///
/// # Errors
///
/// [`OrchestratorError::InvalidConcurrency`].
pub fn validate_concurrency(value: usize) -> Result<usize, OrchestratorError> {
    if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
        Ok(value)
    } else {
        Err(OrchestratorError::InvalidConcurrency { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let error = OrchestratorError::invalid_state(7, ItemState::Downloading, "edit");
        let message = error.to_string();
        assert!(message.contains("cannot edit item 7 while it is downloading"));
        assert!(message.contains("Suggestion"));
    }

    #[test]
    fn test_validate_concurrency_bounds() {
        assert!(validate_concurrency(1).is_ok());
        assert!(validate_concurrency(32).is_ok());
        assert!(matches!(
            validate_concurrency(0),
            Err(OrchestratorError::InvalidConcurrency { value: 0 })
        ));
        assert!(validate_concurrency(33).is_err());
    }
}
