//! Priority-ordered adapter registry.
//!
//! The [`AdapterRegistry`] keeps adapters sorted by [`AdapterPriority`] and
//! dispatches a URL to the first adapter that claims it.

use tracing::{debug, info};

use crate::manifest::Manifest;

use super::{Adapter, ResolveContext, ResolveError};

/// Adapters sorted by priority; registration order breaks ties.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn Adapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.adapters.iter().map(|adapter| adapter.id()))
            .finish()
    }
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, keeping the list sorted by priority.
    #[tracing::instrument(skip(self, adapter), fields(adapter_id = adapter.id()))]
    pub fn register(&mut self, adapter: Box<dyn Adapter>) {
        debug!(priority = ?adapter.priority(), "Registering adapter");
        self.adapters.push(adapter);
        // sort_by_key is stable
        self.adapters.sort_by_key(|adapter| adapter.priority());
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// First adapter that claims `url`.
    #[must_use]
    pub fn find(&self, url: &str) -> Option<&dyn Adapter> {
        self.adapters
            .iter()
            .find(|adapter| adapter.matches(url))
            .map(AsRef::as_ref)
    }

    /// Looks an adapter up by its identifier.
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<&dyn Adapter> {
        self.adapters
            .iter()
            .find(|adapter| adapter.id() == id)
            .map(AsRef::as_ref)
    }

    /// Dispatches `url` to its adapter and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnsupportedSource`] when nothing matches, or
    /// whatever the chosen adapter reports.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let adapter = self
            .find(url)
            .ok_or_else(|| ResolveError::unsupported_source(url))?;
        debug!(adapter = adapter.id(), "Resolving with adapter");

        let manifest = adapter.resolve(url, ctx).await?;
        manifest.validate()?;
        info!(
            adapter = adapter.id(),
            pages = manifest.len(),
            title = manifest.title(),
            "Manifest resolved"
        );
        Ok(manifest)
    }
}
