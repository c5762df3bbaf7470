//! Manifest resolution: turning a library viewer URL into a canonical page list.
//!
//! # Architecture
//!
//! - [`Adapter`] - async trait each host family implements
//! - [`AdapterRegistry`] - priority-ordered adapters, first match wins
//! - [`ManifestResolver`] - registry front with a manifest cache and request coalescing
//! - [`IiifAdapter`] / [`IiifHostAdapter`] - IIIF Presentation v2/v3 manifests
//! - [`ManifestLinkAdapter`] - IIIF manifests linked from a viewer page
//! - [`ContentDmAdapter`] - compound objects embedded in ContentDM viewer pages
//! - [`MdcCataloniaAdapter`] - ContentDM compound-object XML on mdc.csuc.cat
//! - [`EManuscriptaAdapter`] - option-list pagination on e-manuscripta.ch
//! - [`WolfenbuettelAdapter`] / [`FreiburgAdapter`] / [`MorganAdapter`] - scraped thumbnail listings
//! - [`InternetCulturaleAdapter`] - MAG metadata XML
//! - [`OrleansAdapter`] - Omeka S REST API
//! - [`RouenAdapter`] / [`RomeAdapter`] - page counts without a page list
//! - [`BordeauxAdapter`] - Deep Zoom tile pyramids with no manifest at all
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use manuscript_core::fetch::{HttpFetcher, RateLimiter};
//! use manuscript_core::resolver::{ManifestResolver, ResolveContext, build_default_registry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = Arc::new(HttpFetcher::new(Arc::new(RateLimiter::new(Duration::from_millis(250))))?);
//! let resolver = ManifestResolver::new(
//!     Arc::new(build_default_registry()),
//!     ResolveContext::new(fetcher),
//! );
//! let manifest = resolver
//!     .resolve("https://digi.vatlib.it/view/MSS_Vat.lat.3225")
//!     .await?;
//! println!("{} ({} pages)", manifest.title(), manifest.len());
//! # Ok(())
//! # }
//! ```

mod bordeaux;
mod cache;
mod contentdm;
mod emanuscripta;
mod error;
mod freiburg;
mod iiif;
mod iiif_hosts;
mod internet_culturale;
mod manifest_link;
mod mdc_catalonia;
mod morgan;
mod orleans;
mod registry;
mod rome;
mod rouen;
mod utils;
mod wolfenbuettel;

pub use bordeaux::BordeauxAdapter;
pub use cache::ManifestResolver;
pub use contentdm::ContentDmAdapter;
pub use emanuscripta::EManuscriptaAdapter;
pub use error::ResolveError;
pub use freiburg::FreiburgAdapter;
pub use iiif::{IiifAdapter, parse_iiif_manifest};
pub use iiif_hosts::{IiifHost, IiifHostAdapter, ManifestRule, default_hosts};
pub use internet_culturale::InternetCulturaleAdapter;
pub use manifest_link::{LinkedHost, ManifestLinkAdapter, default_linked_hosts};
pub use mdc_catalonia::MdcCataloniaAdapter;
pub use morgan::MorganAdapter;
pub use orleans::OrleansAdapter;
pub use registry::AdapterRegistry;
pub use rome::RomeAdapter;
pub use rouen::RouenAdapter;
pub use utils::normalize_source_url;
pub use wolfenbuettel::WolfenbuettelAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::fetch::{FetchOptions, FetchResponse, Fetcher, RetryPolicy, fetch_with_retry};
use crate::manifest::Manifest;

/// Builds the registry used by the CLI: every host-specific adapter, then the
/// generic IIIF fallback.
#[must_use]
pub fn build_default_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for host in default_hosts() {
        registry.register(Box::new(IiifHostAdapter::new(host)));
    }
    for host in default_linked_hosts() {
        registry.register(Box::new(ManifestLinkAdapter::new(host)));
    }
    // Ahead of ContentDM, which claims the same URL shape on any host.
    registry.register(Box::new(MdcCataloniaAdapter::new()));
    registry.register(Box::new(ContentDmAdapter::new()));
    registry.register(Box::new(EManuscriptaAdapter::new()));
    registry.register(Box::new(BordeauxAdapter::new()));
    registry.register(Box::new(RouenAdapter::new()));
    registry.register(Box::new(InternetCulturaleAdapter::new()));
    registry.register(Box::new(OrleansAdapter::new()));
    registry.register(Box::new(WolfenbuettelAdapter::new()));
    registry.register(Box::new(FreiburgAdapter::new()));
    registry.register(Box::new(RomeAdapter::new()));
    registry.register(Box::new(MorganAdapter::new()));
    registry.register(Box::new(IiifAdapter::new()));
    registry
}

/// Ordering class for adapters.
///
/// Derives `Ord` so that `Specialized < Generic`; the registry sorts ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdapterPriority {
    /// Adapters bound to one host or URL family
    Specialized = 0,
    /// Catch-all adapters such as bare IIIF manifest URLs
    Generic = 1,
}

/// Everything an adapter needs to talk to the network.
///
/// Cheap to clone: the fetcher is shared and the token is a handle.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    fetcher: Arc<dyn Fetcher>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ResolveContext {
    /// Creates a context with the default retry policy.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the retry policy used for manifest fetches.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ties resolution to a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The injected fetcher.
    #[must_use]
    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    /// Fetches `url` with retries, mapping failures into adapter errors.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::TransientFetch`] once retries are exhausted, or
    /// [`ResolveError::PermanentFormat`] for permanent HTTP statuses.
    pub async fn fetch(
        &self,
        adapter: &str,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchResponse, ResolveError> {
        fetch_with_retry(self.fetcher.as_ref(), url, options, &self.retry, &self.cancel)
            .await
            .map_err(|error| ResolveError::from_fetch(adapter, &error))
    }

    /// Fetches `url` and returns the body as text.
    ///
    /// # Errors
    ///
    /// See [`ResolveContext::fetch`].
    pub async fn fetch_text(&self, adapter: &str, url: &str) -> Result<String, ResolveError> {
        Ok(self.fetch(adapter, url, &FetchOptions::default()).await?.text())
    }

    /// Fetches `url` and parses the body as JSON.
    ///
    /// # Errors
    ///
    /// See [`ResolveContext::fetch`]; malformed JSON is [`ResolveError::PermanentFormat`].
    pub async fn fetch_json(
        &self,
        adapter: &str,
        url: &str,
    ) -> Result<serde_json::Value, ResolveError> {
        let response = self.fetch(adapter, url, &FetchOptions::default()).await?;
        serde_json::from_slice(&response.body).map_err(|error| {
            ResolveError::permanent_format(adapter, &format!("'{url}' is not valid JSON: {error}"))
        })
    }

    /// Single-attempt existence check used by page-counting adapters.
    pub async fn exists(&self, url: &str) -> bool {
        let options = FetchOptions::default();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            outcome = self.fetcher.fetch(url, &options) => {
                outcome.is_ok_and(|response| response.is_success())
            }
        }
    }

    /// Like [`ResolveContext::exists`], but the response must also be an
    /// image; some hosts answer missing pages with a 200 HTML page.
    pub async fn image_exists(&self, url: &str) -> bool {
        let options = FetchOptions::default();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            outcome = self.fetcher.fetch(url, &options) => {
                outcome.is_ok_and(|response| {
                    response.is_success()
                        && response
                            .header("content-type")
                            .is_some_and(|kind| kind.to_ascii_lowercase().starts_with("image/"))
                })
            }
        }
    }
}

/// One family of library hosts.
///
/// Uses `async_trait` so adapters can live as `Box<dyn Adapter>` in the registry.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable identifier, persisted with queue items.
    fn id(&self) -> &'static str;

    /// Ordering class within the registry.
    fn priority(&self) -> AdapterPriority;

    /// Returns true if this adapter recognizes `url`.
    fn matches(&self, url: &str) -> bool;

    /// Upper bound on concurrent page fetches for this host, if it needs one.
    fn concurrency_cap(&self) -> Option<usize> {
        None
    }

    /// Fetches whatever the host exposes and produces the page list.
    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::MockFetcher;

    #[test]
    fn test_adapter_priority_ordering() {
        assert!(AdapterPriority::Specialized < AdapterPriority::Generic);
    }

    #[test]
    fn test_default_registry_routes_known_hosts() {
        let registry = build_default_registry();
        let cases = [
            ("https://digi.vatlib.it/view/MSS_Vat.lat.3225", "vatican"),
            ("https://digital.bodleian.ox.ac.uk/objects/abc-123/", "bodleian"),
            (
                "https://www.e-manuscripta.ch/zuz/content/zoom/1234",
                "e-manuscripta",
            ),
            ("https://selene.bordeaux.fr/in/dz/ms0673_0001.dzi", "bordeaux"),
            (
                "https://tecabml.contentdm.oclc.org/digital/collection/plutei/id/1234",
                "contentdm",
            ),
            ("https://iiif.example.org/ms/7/manifest.json", "iiif"),
            (
                "https://unipub.uni-graz.at/obvugrscript/content/titleinfo/8224538",
                "graz",
            ),
            ("https://www.themorgan.org/collection/lindau-gospels", "morgan"),
            ("https://manuscripta.at/diglit/AT5000-1013", "vienna-manuscripta"),
            (
                "https://www.nuovabibliotecamanoscritta.it/Generale/BibliotecaDigitale/caricaVolumi.html?codice=15",
                "verona",
            ),
            (
                "https://www.internetculturale.it/jmms/iccuviewer/iccu.jsp?id=oai%3Awww.internetculturale.sbn.it%2FTeca%3A20%3ANT0000%3AN%3AFI0098_Plut.21.1&mode=all&teca=Laurenziana+-+FI",
                "internet-culturale",
            ),
            (
                "http://digitale.bnc.roma.sbn.it/tecadigitale/manoscrittoantico/BNCR_Ms_SESS_0062/BNCR_Ms_SESS_0062/1",
                "rome",
            ),
            ("https://collections.library.utoronto.ca/view/fisher2:F6521", "toronto"),
            ("https://www.rotomagus.fr/ark:/12148/btv1b10052442z/f1.item.zoom", "rouen"),
            ("https://aurelia.orleans.fr/s/aurelia/item/257012", "orleans"),
            ("https://diglib.hab.de/wdb.php?dir=mss/1008-helmst", "wolfenbuettel"),
            ("https://dl.ub.uni-freiburg.de/diglit/codal_25", "freiburg"),
            ("https://digital.ulb.hhu.de/ms/content/titleinfo/7674176", "hhu"),
            (
                "https://mdc.csuc.cat/digital/collection/incunableBC/id/175331/rec/1",
                "mdc-catalonia",
            ),
            ("https://admont.codices.at/codices/169/90299", "codices"),
            ("https://digitallibrary.unicatt.it/veneranda/0b02da82800c3ea6", "unicatt"),
            ("https://rbme.patrimonionacional.es/s/rbme/item/14374", "rbme"),
        ];
        for (url, expected) in cases {
            let adapter = registry.find(url).unwrap();
            assert_eq!(adapter.id(), expected, "url: {url}");
        }
        assert!(registry.find("https://example.com/about").is_none());
    }

    #[tokio::test]
    async fn test_context_fetch_json_reports_bad_json_as_format_error() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://h/m.json", MockFetcher::text("not json"));
        let ctx = ResolveContext::new(fetcher);
        let error = ctx.fetch_json("iiif", "https://h/m.json").await.unwrap_err();
        assert!(matches!(error, ResolveError::PermanentFormat { .. }));
    }

    #[tokio::test]
    async fn test_context_exists_is_single_attempt() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://h/t.jpg", MockFetcher::status(503));
        let ctx = ResolveContext::new(fetcher.clone());
        assert!(!ctx.exists("https://h/t.jpg").await);
        assert_eq!(fetcher.calls("https://h/t.jpg"), 1);
    }

    #[tokio::test]
    async fn test_context_exists_reports_hits_and_honours_cancellation() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://h/hit.jpg", MockFetcher::bytes(vec![1, 2, 3]));
        let ctx = ResolveContext::new(fetcher.clone());
        assert!(ctx.exists("https://h/hit.jpg").await);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = ResolveContext::new(fetcher.clone()).with_cancellation(cancel);
        assert!(!cancelled.exists("https://h/hit.jpg").await);
        assert_eq!(fetcher.calls("https://h/hit.jpg"), 1);
    }

    #[tokio::test]
    async fn test_context_image_exists_rejects_html_placeholders() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://h/1.jpg", MockFetcher::typed(b"jpeg", "image/jpeg"));
        fetcher.respond("https://h/2.jpg", MockFetcher::typed(b"<html>", "text/html; charset=utf-8"));
        fetcher.respond("https://h/3.jpg", MockFetcher::bytes(vec![1]));
        let ctx = ResolveContext::new(fetcher);
        assert!(ctx.image_exists("https://h/1.jpg").await);
        assert!(!ctx.image_exists("https://h/2.jpg").await);
        assert!(!ctx.image_exists("https://h/3.jpg").await);
        assert!(!ctx.image_exists("https://h/4.jpg").await);
    }
}
