//! Constants for the fetch layer (timeouts, size caps, politeness).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (2 minutes; full-resolution scans can be large).
pub const READ_TIMEOUT_SECS: u64 = 120;

/// Largest response body accepted for a single page or manifest (512 MiB).
pub const MAX_BODY_BYTES: u64 = 512 * 1024 * 1024;

/// Warning threshold for cumulative rate limit delay per domain (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
