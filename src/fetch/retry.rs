//! Retry with exponential backoff for transient fetch failures.
//!
//! Every fetch error is classified into a [`FailureType`]; the
//! [`RetryPolicy`] then decides whether another attempt is worthwhile and how
//! long to wait first. [`fetch_with_retry`] ties the two together around an
//! injected [`Fetcher`] and stays responsive to cancellation while waiting.
//!
//! ```
//! use manuscript_core::fetch::{FetchError, FailureType, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = FetchError::http_status("https://example.com/page.jpg", 503);
//! assert_eq!(classify_error(&error), FailureType::Transient);
//! assert!(matches!(policy.should_retry(FailureType::Transient, 1), RetryDecision::Retry { .. }));
//! ```

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{FetchError, FetchOptions, FetchResponse, Fetcher};

/// Default maximum attempts per request (including the first).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Upper bound on jitter; the effective bound is also at most half the base delay.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of fetch failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Timeouts, connection resets, 408 and 5xx responses.
    Transient,
    /// Anything a retry cannot fix (404, 403, malformed URL, cancellation).
    Permanent,
    /// HTTP 429; retried, honouring `Retry-After`.
    RateLimited,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`; `attempt` is the 1-indexed number of the next attempt.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Attempt number of the upcoming request.
        attempt: u32,
    },
    /// Give up.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Bounded exponential backoff.
///
/// `delay = min(base * multiplier^(attempt-1), max_delay) + jitter`, so with
/// defaults the waits are roughly 1s, 2s before the third and final attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit settings; `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Creates a default policy with a custom attempt budget.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Decides whether to retry after `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.calculate_delay(attempt),
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let bound = MAX_JITTER.min(self.base_delay / 2).as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

/// Classifies a fetch error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | 408, 5xx | Transient |
/// | 429 | RateLimited |
/// | other 4xx | Permanent |
/// | Timeout | Transient |
/// | Network (TLS/certificate) | Permanent |
/// | Network (other) | Transient |
/// | InvalidUrl, BodyTooLarge, Cancelled | Permanent |
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),
        FetchError::Timeout { .. } => FailureType::Transient,
        FetchError::Network { message, .. } => {
            if is_tls_message(message) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        FetchError::InvalidUrl { .. }
        | FetchError::BodyTooLarge { .. }
        | FetchError::Cancelled { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        400..=499 => FailureType::Permanent,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("certificate") || message.contains("tls") || message.contains("ssl")
}

/// Fetches `url`, retrying transient failures according to `policy`.
///
/// Non-success statuses are turned into [`FetchError::HttpStatus`] before
/// classification. A `Retry-After` hint raises the backoff delay (never above
/// the policy cap). Cancellation interrupts both the request and the backoff
/// sleep and yields [`FetchError::Cancelled`].
///
/// # Errors
///
/// Returns the last error once retries are exhausted or the failure is permanent.
#[instrument(skip(fetcher, options, policy, cancel))]
pub async fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &str,
    options: &FetchOptions,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<FetchResponse, FetchError> {
    let mut attempt = 1;
    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::cancelled(url)),
            outcome = fetcher.fetch(url, options) => outcome.and_then(|response| response.error_for_status(url)),
        };

        let error = match outcome {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        match policy.should_retry(classify_error(&error), attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next,
            } => {
                let delay = error
                    .retry_after()
                    .map_or(delay, |hint| delay.max(hint.min(policy.max_delay())));
                info!(
                    url,
                    attempt = next,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "retrying fetch"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(FetchError::cancelled(url)),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt = next;
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(url, attempt, reason, error = %error, "giving up on fetch");
                return Err(error);
            }
        }
    }
}
