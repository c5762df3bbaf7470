//! reqwest-backed [`Fetcher`].

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind, set_hook, take_hook};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::cookie::Jar;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, ClientBuilder, Proxy};
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, MAX_BODY_BYTES, READ_TIMEOUT_SECS};
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::{FetchError, FetchOptions, FetchResponse, Fetcher};
use crate::user_agent;

/// HTTP fetcher with shared cookie jar, timeouts and per-host pacing.
///
/// ```no_run
/// use std::sync::Arc;
/// use manuscript_core::fetch::{FetchOptions, Fetcher, HttpFetcher, RateLimiter};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = HttpFetcher::new(Arc::new(RateLimiter::disabled()))?;
/// let response = fetcher
///     .fetch("https://digi.vatlib.it/iiif/MSS_Urb.lat.365/manifest.json", &FetchOptions::default())
///     .await?;
/// println!("{} bytes", response.body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    rate_limiter: Arc<RateLimiter>,
    max_body_bytes: u64,
}

impl HttpFetcher {
    /// Creates a fetcher with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Network`] if the HTTP client cannot be built.
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Result<Self, FetchError> {
        Self::with_timeouts(rate_limiter, CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a fetcher with explicit connect/read timeouts in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Network`] if the HTTP client cannot be built.
    pub fn with_timeouts(
        rate_limiter: Arc<RateLimiter>,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, FetchError> {
        let jar = Arc::new(Jar::default());
        let client = build_client(jar, connect_timeout_secs, read_timeout_secs)?;
        Ok(Self {
            client,
            rate_limiter,
            max_body_bytes: MAX_BODY_BYTES,
        })
    }

    /// Overrides the response body cap.
    #[must_use]
    pub fn with_max_body_bytes(mut self, limit: u64) -> Self {
        self.max_body_bytes = limit;
        self
    }

    async fn read_body(&self, url: &str, response: reqwest::Response) -> Result<Bytes, FetchError> {
        if let Some(length) = response.content_length()
            && length > self.max_body_bytes
        {
            return Err(FetchError::BodyTooLarge {
                url: url.to_string(),
                limit: self.max_body_bytes,
            });
        }

        let mut buffer = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_transport_error(url, &e))?;
            if buffer.len() as u64 + chunk.len() as u64 > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge {
                    url: url.to_string(),
                    limit: self.max_body_bytes,
                });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, options), fields(status))]
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::invalid_url(url));
        }

        self.rate_limiter.acquire(url).await;

        let mut request = self.client.get(parsed);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(url, &e))?;

        let status = response.status().as_u16();
        tracing::Span::current().record("status", status);

        if matches!(status, 429 | 503)
            && let Some(delay) = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
        {
            self.rate_limiter.record_rate_limit(url, delay).await;
        }

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = self.read_body(url, response).await?;
        debug!(url, status, bytes = body.len(), "fetched");
        Ok(FetchResponse::new(status, headers, body))
    }
}

fn map_transport_error(url: &str, error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else {
        FetchError::network(url, error.to_string())
    }
}

fn build_client(
    jar: Arc<Jar>,
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
) -> Result<Client, FetchError> {
    match try_build_client(Arc::clone(&jar), connect_timeout_secs, read_timeout_secs, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            // Some sandboxed environments panic while reading system proxy settings.
            warn!("HTTP client builder panicked loading system proxy settings; using env-proxy fallback");
            match try_build_client(jar, connect_timeout_secs, read_timeout_secs, true) {
                Ok(client) => Ok(client),
                Err(BuildClientFailure::Panic) => Err(FetchError::network(
                    "client",
                    "HTTP client construction panicked while applying env-proxy fallback",
                )),
                Err(BuildClientFailure::Build(error)) => {
                    Err(FetchError::network("client", error.to_string()))
                }
            }
        }
        Err(BuildClientFailure::Build(error)) => {
            Err(FetchError::network("client", error.to_string()))
        }
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

// catch_unwind does not silence the panic hook; swap it out briefly so an
// expected proxy panic does not spill onto stderr.
static CLIENT_BUILD_PANIC_HOOK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn try_build_client(
    jar: Arc<Jar>,
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    let _guard = CLIENT_BUILD_PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let previous_hook = take_hook();
    set_hook(Box::new(|_| {}));
    let outcome = catch_unwind(AssertUnwindSafe(move || {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .cookie_provider(jar);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }));
    set_hook(previous_hook);
    outcome.map_err(|_| BuildClientFailure::Panic)?
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy_for_scheme("https")
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy_for_scheme("http")
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    let names: &[&str] = match scheme {
        "https" => &["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"],
        "http" => &["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"],
        _ => return None,
    };
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
