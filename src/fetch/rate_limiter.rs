//! Per-host request pacing.
//!
//! Digital-library image servers are often small institutional deployments
//! that throttle or ban aggressive clients. [`RateLimiter`] keeps a minimum
//! gap between consecutive requests to the same host while letting different
//! hosts proceed independently, and remembers server-mandated pauses
//! announced through `Retry-After`.
//!
//! ```
//! use std::time::Duration;
//! use manuscript_core::fetch::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(250));
//! limiter.acquire("https://digi.vatlib.it/iiif/MSS_Vat.lat.3225/manifest.json").await;
//! limiter.acquire("https://iiif.bodleian.ox.ac.uk/iiif/manifest/x.json").await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Per-host rate limiter, shared across fetch tasks behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    min_gap: Duration,
    disabled: bool,
    // Arc so the DashMap shard lock is released before awaiting the host mutex.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug, Default)]
struct HostState {
    /// `None` until the first request; the first request never waits.
    last_request: Mutex<Option<Instant>>,
    /// Server-imposed earliest time for the next request.
    blocked_until: Mutex<Option<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    #[allow(clippy::cast_possible_truncation)]
    fn add_delay(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        Duration::from_millis(self.cumulative_delay_ms.fetch_add(ms, Ordering::SeqCst) + ms)
    }
}

impl RateLimiter {
    /// Creates a limiter enforcing `min_gap` between requests to one host.
    #[must_use]
    #[instrument(skip_all, fields(min_gap_ms = min_gap.as_millis()))]
    pub fn new(min_gap: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            min_gap,
            disabled: false,
            hosts: DashMap::new(),
        }
    }

    /// Creates a limiter that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            min_gap: Duration::ZERO,
            disabled: true,
            hosts: DashMap::new(),
        }
    }

    /// Returns whether pacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the configured minimum gap.
    #[must_use]
    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    fn host_state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::default()))
            .clone()
    }

    /// Waits until a request to `url`'s host is allowed, then records it.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        if self.disabled {
            return;
        }

        let host = extract_domain(url);
        tracing::Span::current().record("host", host.as_str());
        let state = self.host_state(&host);

        let mut last_request = state.last_request.lock().await;

        let mut wait = Duration::ZERO;
        if let Some(previous) = *last_request {
            wait = self.min_gap.saturating_sub(previous.elapsed());
        }
        if let Some(until) = *state.blocked_until.lock().await {
            wait = wait.max(until.saturating_duration_since(Instant::now()));
        }

        if wait > Duration::ZERO {
            let cumulative = state.add_delay(wait);
            debug!(
                host = %host,
                delay_ms = wait.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "pacing request"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    host = %host,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "heavy pacing for host - consider lowering concurrency"
                );
            }
            tokio::time::sleep(wait).await;
        }

        *last_request = Some(Instant::now());
    }

    /// Records a server-mandated pause (from `Retry-After`) for `url`'s host.
    ///
    /// Later [`acquire`](Self::acquire) calls for the host wait until the pause
    /// has elapsed, even when pacing would otherwise allow the request.
    #[instrument(skip(self), fields(host))]
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        if self.disabled {
            return;
        }
        let host = extract_domain(url);
        tracing::Span::current().record("host", host.as_str());

        let delay = delay.min(MAX_RETRY_AFTER);
        let state = self.host_state(&host);
        let until = Instant::now() + delay;
        {
            let mut blocked = state.blocked_until.lock().await;
            *blocked = Some(blocked.map_or(until, |current| current.max(until)));
        }
        let cumulative = state.add_delay(delay);
        debug!(
            host = %host,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
    }
}

/// Extracts the lowercased host from a URL, or `"unknown"` when it has none.
///
/// ```
/// use manuscript_core::fetch::extract_domain;
///
/// assert_eq!(extract_domain("https://Digi.VATLIB.it/view/x"), "digi.vatlib.it");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a `Retry-After` value (delta seconds or HTTP-date), capped at one hour.
///
/// ```
/// use std::time::Duration;
/// use manuscript_core::fetch::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(when) => Some(
            when.duration_since(std::time::SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .min(MAX_RETRY_AFTER),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RateLimiter Tests ====================

    #[tokio::test]
    async fn test_disabled_limiter_never_waits() {
        let limiter = RateLimiter::disabled();
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire("https://example.com/a").await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(limiter.is_disabled());
    }

    #[tokio::test]
    async fn test_first_request_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        let start = Instant::now();
        limiter.acquire("https://example.com/a").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_same_host_is_paced() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        limiter.acquire("https://example.com/a").await;
        let start = Instant::now();
        limiter.acquire("https://example.com/b").await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_different_hosts_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        limiter.acquire("https://one.example/a").await;
        let start = Instant::now();
        limiter.acquire("https://two.example/a").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_recorded_rate_limit_blocks_next_request() {
        let limiter = RateLimiter::new(Duration::ZERO);
        limiter
            .record_rate_limit("https://example.com/a", Duration::from_millis(120))
            .await;
        let start = Instant::now();
        limiter.acquire("https://example.com/b").await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    // ==================== Parsing Tests ====================

    #[test]
    fn test_extract_domain_variants() {
        assert_eq!(extract_domain("https://example.com/path"), "example.com");
        assert_eq!(extract_domain("http://Example.COM/Path"), "example.com");
        assert_eq!(extract_domain("https://localhost:8080/x"), "localhost");
        assert_eq!(extract_domain(""), "unknown");
    }

    #[test]
    fn test_parse_retry_after_seconds_and_caps() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_http_date_in_future() {
        let future = std::time::SystemTime::now() + Duration::from_secs(60);
        let header = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&header).unwrap();
        assert!(parsed <= Duration::from_secs(60));
        assert!(parsed >= Duration::from_secs(55));
    }
}
