//! e-manuscripta.ch: pages enumerated by the viewer's page-select `<option>` list.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::fetch::FetchOptions;
use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::{compile_static_regex, html_title};
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "e-manuscripta";

static VIEWER_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r"(?i)e-manuscripta\.ch/(?P<library>[^/]+)/content/(?:zoom|titleinfo|thumbview)/(?P<id>\d+)",
    )
});

static PAGE_OPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"<option\s+value="(\d+)"[^>]*>\[(\d+)\]\s*</option>"#)
});

/// Adapter for `e-manuscripta.ch/{library}/content/{zoom|titleinfo|thumbview}/{id}`.
#[derive(Debug, Default)]
pub struct EManuscriptaAdapter;

impl EManuscriptaAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for EManuscriptaAdapter {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    fn matches(&self, url: &str) -> bool {
        VIEWER_URL_RE.is_match(url)
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let caps = VIEWER_URL_RE
            .captures(url)
            .ok_or_else(|| ResolveError::unsupported_source(url))?;
        let library = caps["library"].to_string();
        let id = caps["id"].to_string();
        let url = url.trim();

        let mut html = ctx.fetch_text(ADAPTER_ID, url).await?;
        let mut pages = page_options(&html);
        if pages.is_empty() && is_javascript_check(&html) {
            debug!("JavaScript check page; retrying with js_enabled cookie");
            let options = FetchOptions::default().with_header("Cookie", "js_enabled=1");
            html = ctx.fetch(ADAPTER_ID, url, &options).await?.text();
            pages = page_options(&html);
        }
        if pages.is_empty() {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                "viewer page lists no pages",
            ));
        }

        let title = html_title(&html).unwrap_or_else(|| format!("e-manuscripta {library} {id}"));
        let pages = pages.into_iter().map(|(number, page_id)| {
            (
                format!("Page {number}"),
                ImageLocator::Direct {
                    url: format!(
                        "https://www.e-manuscripta.ch/{library}/download/webcache/2000/{page_id}"
                    ),
                },
            )
        });
        Manifest::from_ordered(title, Source::new(url, ADAPTER_ID), pages)
    }
}

/// Page number to page id, first occurrence wins, ordered by page number.
fn page_options(html: &str) -> BTreeMap<u32, String> {
    let mut pages = BTreeMap::new();
    for caps in PAGE_OPTION_RE.captures_iter(html) {
        if let Ok(number) = caps[2].parse::<u32>() {
            pages.entry(number).or_insert_with(|| caps[1].to_string());
        }
    }
    pages
}

fn is_javascript_check(html: &str) -> bool {
    html.contains("js_enabled") || html.contains("js_check_beacon") || html.contains("JavaScript")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_support::MockFetcher;

    const URL: &str = "https://www.e-manuscripta.ch/zuz/content/zoom/1460717";

    fn select_html() -> String {
        r#"<html><head><title>Ms. C 10 / Zentralbibliothek Zürich</title></head>
        <select>
          <option value="1460730">[3] </option>
          <option value="1460717">[1] </option>
          <option value="1460718">[2]</option>
          <option value="9999999">[2] </option>
          <option value="1460800">[10] </option>
        </select></html>"#
            .to_string()
    }

    fn urls(manifest: &Manifest) -> Vec<String> {
        manifest
            .pages()
            .iter()
            .map(|page| match &page.locator {
                ImageLocator::Direct { url } => url.clone(),
                ImageLocator::Tiled(_) => panic!("tiled"),
            })
            .collect()
    }

    // ==================== Option List Tests ====================

    #[test]
    fn test_page_options_dedup_and_sort_by_number() {
        let pages = page_options(&select_html());
        let ordered: Vec<(u32, &str)> = pages.iter().map(|(n, id)| (*n, id.as_str())).collect();
        assert_eq!(
            ordered,
            vec![(1, "1460717"), (2, "1460718"), (3, "1460730"), (10, "1460800")]
        );
    }

    #[tokio::test]
    async fn test_resolve_builds_webcache_urls() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(URL, MockFetcher::text(&select_html()));
        let ctx = ResolveContext::new(fetcher);

        let manifest = EManuscriptaAdapter::new().resolve(URL, &ctx).await.unwrap();
        assert_eq!(manifest.title(), "Ms. C 10 / Zentralbibliothek Zürich");
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.pages()[3].label, "Page 10");
        assert_eq!(
            urls(&manifest)[0],
            "https://www.e-manuscripta.ch/zuz/download/webcache/2000/1460717"
        );
    }

    #[tokio::test]
    async fn test_javascript_check_retries_once_with_cookie() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_sequence(
            URL,
            vec![
                MockFetcher::text("<script>document.cookie='js_enabled=1'; js_check_beacon()</script>"),
                MockFetcher::text(&select_html()),
            ],
        );
        let ctx = ResolveContext::new(fetcher.clone());

        let manifest = EManuscriptaAdapter::new().resolve(URL, &ctx).await.unwrap();
        assert_eq!(manifest.len(), 4);
        assert_eq!(fetcher.calls(URL), 2);
    }

    #[tokio::test]
    async fn test_no_options_is_format_error() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(URL, MockFetcher::text("<html><title>x</title></html>"));
        let ctx = ResolveContext::new(fetcher);
        let error = EManuscriptaAdapter::new().resolve(URL, &ctx).await.unwrap_err();
        assert!(matches!(error, ResolveError::PermanentFormat { .. }));
    }

    #[test]
    fn test_matches_viewer_variants() {
        let adapter = EManuscriptaAdapter::new();
        assert!(adapter.matches(URL));
        assert!(adapter.matches("https://www.e-manuscripta.ch/bau/content/titleinfo/5157222"));
        assert!(adapter.matches("https://www.e-manuscripta.ch/bau/content/thumbview/5157222"));
        assert!(!adapter.matches("https://www.e-manuscripta.ch/bau/search"));
    }
}
