//! Manifest cache with request coalescing.
//!
//! Concurrent resolutions of the same normalized URL share one in-flight
//! future, so the host sees a single manifest request no matter how many
//! queue items or CLI calls ask for it at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, instrument};

use crate::manifest::Manifest;

use super::utils::normalize_source_url;
use super::{Adapter, AdapterRegistry, ResolveContext, ResolveError};

type SharedResolution = Shared<BoxFuture<'static, Result<Arc<Manifest>, ResolveError>>>;

/// Registry front that caches successful manifests by normalized URL.
///
/// Errors are never cached; a failed key is retried on the next call.
pub struct ManifestResolver {
    registry: Arc<AdapterRegistry>,
    ctx: ResolveContext,
    cache: Arc<DashMap<String, Arc<Manifest>>>,
    in_flight: Arc<Mutex<HashMap<String, SharedResolution>>>,
}

impl std::fmt::Debug for ManifestResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestResolver")
            .field("registry", &self.registry)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl ManifestResolver {
    /// Creates a resolver over `registry` using `ctx` for network access.
    #[must_use]
    pub fn new(registry: Arc<AdapterRegistry>, ctx: ResolveContext) -> Self {
        Self {
            registry,
            ctx,
            cache: Arc::new(DashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Adapter that would handle `url`, without fetching anything.
    #[must_use]
    pub fn adapter_for(&self, url: &str) -> Option<&dyn Adapter> {
        self.registry.find(url)
    }

    /// Resolves `url`, serving from cache or joining an in-flight resolution.
    ///
    /// # Errors
    ///
    /// Propagates [`ResolveError`] from the registry and adapter.
    #[instrument(skip(self))]
    pub async fn resolve(&self, url: &str) -> Result<Arc<Manifest>, ResolveError> {
        let key = normalize_source_url(url);
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "Manifest cache hit");
            return Ok(Arc::clone(hit.value()));
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            // The winning future may have finished between the cache lookup and the lock.
            if let Some(hit) = self.cache.get(&key) {
                return Ok(Arc::clone(hit.value()));
            }
            if let Some(existing) = in_flight.get(&key) {
                debug!(key = %key, "Joining in-flight resolution");
                existing.clone()
            } else {
                let shared = self.spawn_resolution(url, &key);
                in_flight.insert(key.clone(), shared.clone());
                shared
            }
        };

        shared.await
    }

    fn spawn_resolution(&self, url: &str, key: &str) -> SharedResolution {
        let registry = Arc::clone(&self.registry);
        let ctx = self.ctx.clone();
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let url = url.to_string();
        let key = key.to_string();

        async move {
            let outcome = registry.resolve(&url, &ctx).await.map(Arc::new);
            if let Ok(manifest) = &outcome {
                cache.insert(key.clone(), Arc::clone(manifest));
            }
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            outcome
        }
        .boxed()
        .shared()
    }

    /// Drops the cached manifest for `url` so the next call re-resolves.
    pub fn invalidate(&self, url: &str) {
        self.cache.remove(&normalize_source_url(url));
    }

    /// Empties the cache.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached manifests.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
