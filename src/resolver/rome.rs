//! Rome (Biblioteca Nazionale Centrale, Teca Digitale): no manifest, and the
//! image server answers missing pages with a 200 HTML page.
//!
//! The page count is found by galloping up from page 1 and then bisecting the
//! gap between the last page that served an image and the first that did not.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "rome";
const IMAGE_BASE_URL: &str = "http://digitale.bnc.roma.sbn.it/tecadigitale/img";

/// Upper bound on the page count search.
pub const MAX_ROME_PAGES: u32 = 4096;

static VIEWER_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r"(?i)^https?://digitale\.bnc\.roma\.sbn\.it/tecadigitale/(?P<kind>manoscrittoantico|libroantico)/(?P<id>[^/?#]+)/(?P<again>[^/?#]+)/\d+",
    )
});

/// Adapter for Teca Digitale viewer links (`.../{kind}/{id}/{id}/{page}`).
#[derive(Debug, Default)]
pub struct RomeAdapter;

impl RomeAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for RomeAdapter {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    fn matches(&self, url: &str) -> bool {
        VIEWER_URL_RE.is_match(url.trim())
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let url = url.trim();
        let caps = VIEWER_URL_RE
            .captures(url)
            .ok_or_else(|| ResolveError::unsupported_source(url))?;
        if caps["id"] != caps["again"] {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                "viewer URL names two different manuscripts",
            ));
        }
        let kind = caps["kind"].to_ascii_lowercase();
        let id = caps["id"].to_string();

        let count = count_pages(ctx, |page| image_url(&kind, &id, page)).await;
        if count == 0 {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                &format!("no page images served for '{id}'"),
            ));
        }
        info!(id = %id, pages = count, "Determined Teca Digitale page count");

        let pages = (1..=count).map(|page| {
            (
                format!("Page {page}"),
                ImageLocator::Direct {
                    url: image_url(&kind, &id, page),
                },
            )
        });
        Manifest::from_ordered(id.clone(), Source::new(url, ADAPTER_ID), pages)
    }
}

fn image_url(kind: &str, id: &str, page: u32) -> String {
    format!("{IMAGE_BASE_URL}/{kind}/{id}/{id}/{page}/original")
}

/// Highest page serving an image, assuming pages `1..=N` all exist.
async fn count_pages(ctx: &ResolveContext, url_for: impl Fn(u32) -> String) -> u32 {
    if !ctx.image_exists(&url_for(1)).await {
        return 0;
    }
    // `low` serves an image; `high` does not (or lies past the ceiling).
    let mut low = 1;
    let mut high = 2;
    while high <= MAX_ROME_PAGES && ctx.image_exists(&url_for(high)).await {
        low = high;
        high *= 2;
    }
    high = high.min(MAX_ROME_PAGES + 1);
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if ctx.image_exists(&url_for(mid)).await {
            low = mid;
        } else {
            high = mid;
        }
    }
    debug!(pages = low, "Bisection settled");
    low
}
