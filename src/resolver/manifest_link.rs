//! Hosts whose viewer pages embed the IIIF manifest link instead of deriving
//! it from the URL.
//!
//! The viewer page is fetched and searched for the link; when the viewer URL
//! itself already carries it, the page fetch is skipped.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::manifest::{Manifest, Source};

use super::iiif::parse_iiif_manifest;
use super::utils::{compile_static_regex, decode_html_entities};
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

/// One row of the embedded-link table.
#[derive(Debug, Clone, Copy)]
pub struct LinkedHost {
    /// Adapter identifier.
    pub id: &'static str,
    /// Viewer URL pattern.
    pub pattern: &'static str,
    /// Finds the manifest reference in page text; named groups feed the template.
    pub link: &'static str,
    /// Manifest URL with `${name}` references to the link's groups.
    pub manifest_template: &'static str,
}

/// Built-in embedded-link hosts.
#[must_use]
pub fn default_linked_hosts() -> Vec<LinkedHost> {
    vec![
        LinkedHost {
            id: "rbme",
            pattern: r"(?i)^https?://rbme\.patrimonionacional\.es/s/rbme/item/\d+",
            link: r#"(?P<url>https://rbdigital\.realbiblioteca\.es/files/manifests/[^"'\s<>\\]+)"#,
            manifest_template: "${url}",
        },
        LinkedHost {
            id: "codices",
            pattern: r"(?i)^https?://admont\.codices\.at/",
            link: r"(?i)iiif/(?P<uuid>[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
            manifest_template: "https://admont.codices.at/iiif/${uuid}",
        },
    ]
}

/// Adapter for one [`LinkedHost`] row.
#[derive(Debug)]
pub struct ManifestLinkAdapter {
    host: LinkedHost,
    pattern: Regex,
    link: Regex,
}

impl ManifestLinkAdapter {
    /// Compiles the row's patterns.
    #[must_use]
    pub fn new(host: LinkedHost) -> Self {
        Self {
            pattern: compile_static_regex(host.pattern),
            link: compile_static_regex(host.link),
            host,
        }
    }

    /// Manifest URL referenced by `text`, if any.
    #[must_use]
    pub fn find_manifest(&self, text: &str) -> Option<String> {
        let captures = self.link.captures(text)?;
        let mut manifest = String::new();
        captures.expand(self.host.manifest_template, &mut manifest);
        Some(decode_html_entities(&manifest))
    }
}

#[async_trait]
impl Adapter for ManifestLinkAdapter {
    fn id(&self) -> &'static str {
        self.host.id
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url.trim())
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let url = url.trim();
        let manifest_url = match self.find_manifest(url) {
            Some(direct) => direct,
            None => {
                let html = ctx.fetch_text(self.id(), url).await?;
                self.find_manifest(&html).ok_or_else(|| {
                    ResolveError::permanent_format(self.id(), "viewer page references no IIIF manifest")
                })?
            }
        };
        debug!(adapter = self.id(), manifest_url = %manifest_url, "Following embedded manifest link");
        let document = ctx.fetch_json(self.id(), &manifest_url).await?;
        parse_iiif_manifest(&document, Source::new(url, self.id()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::test_support::MockFetcher;

    const CODICES_UUID: &str = "9cec1d04-d5c3-4a2a-9aa8-4279b359e701";

    fn adapter(id: &str) -> ManifestLinkAdapter {
        ManifestLinkAdapter::new(
            default_linked_hosts()
                .into_iter()
                .find(|host| host.id == id)
                .unwrap(),
        )
    }

    fn one_page_manifest(label: &str) -> serde_json::Value {
        json!({
            "label": label,
            "sequences": [{"canvases": [
                {"label": "1r", "images": [{"resource": {"service": {"@id": "https://img/p1"}}}]}
            ]}]
        })
    }

    // ==================== Link Discovery Tests ====================

    #[test]
    fn test_find_manifest_in_viewer_markup() {
        let rbme = adapter("rbme");
        let html = r#"<script>var cfg = {"manifest":"https://rbdigital.realbiblioteca.es/files/manifests/II_3212.json"};</script>"#;
        assert_eq!(
            rbme.find_manifest(html).unwrap(),
            "https://rbdigital.realbiblioteca.es/files/manifests/II_3212.json"
        );

        let codices = adapter("codices");
        let html = format!(r#"<div data-manifest="/iiif/{CODICES_UUID}"></div>"#);
        assert_eq!(
            codices.find_manifest(&html).unwrap(),
            format!("https://admont.codices.at/iiif/{CODICES_UUID}")
        );
        assert!(codices.find_manifest("<html>no viewer here</html>").is_none());
    }

    #[tokio::test]
    async fn test_resolve_scrapes_viewer_page() {
        let url = "https://rbme.patrimonionacional.es/s/rbme/item/14374";
        let manifest_url = "https://rbdigital.realbiblioteca.es/files/manifests/II_3212.json";
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(url, MockFetcher::text(&format!(r#"<a href="{manifest_url}">IIIF</a>"#)));
        fetcher.respond(manifest_url, MockFetcher::json(&one_page_manifest("Cantigas")));
        let ctx = ResolveContext::new(fetcher);

        let manifest = adapter("rbme").resolve(url, &ctx).await.unwrap();
        assert_eq!(manifest.title(), "Cantigas");
        assert_eq!(manifest.source().adapter_id, "rbme");
    }

    #[tokio::test]
    async fn test_direct_manifest_url_skips_page_fetch() {
        let url = format!("https://admont.codices.at/iiif/{CODICES_UUID}");
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(&url, MockFetcher::json(&one_page_manifest("Cod. 23")));
        let ctx = ResolveContext::new(fetcher.clone());

        let manifest = adapter("codices").resolve(&url, &ctx).await.unwrap();
        assert_eq!(manifest.title(), "Cod. 23");
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_page_without_link_is_format_error() {
        let url = "https://admont.codices.at/codices/169/90299";
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(url, MockFetcher::text("<html><body>loading…</body></html>"));
        let ctx = ResolveContext::new(fetcher);
        let error = adapter("codices").resolve(url, &ctx).await.unwrap_err();
        assert!(matches!(error, ResolveError::PermanentFormat { .. }));
    }
}
