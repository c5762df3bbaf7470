//! Freiburg (UB Freiburg digital collections): page numbers come from the
//! thumbnail overview, and each page's viewer names its `diglitData` image.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use regex::Regex;
use tracing::{debug, warn};

use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::{compile_static_regex, decode_html_entities};
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "freiburg";
const BASE_URL: &str = "https://dl.ub.uni-freiburg.de";

/// Page viewers fetched at once.
const PAGE_BATCH: usize = 10;

/// Resolution level of the largest `diglitData` derivative.
const MAX_RESOLUTION_LEVEL: &str = "/4/";

static VIEWER_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^https?://dl\.ub\.uni-freiburg\.de/diglit/(?P<id>[^/?#]+)")
});

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<h1[^>]*>(?P<text>.*?)</h1>"));

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"<[^>]+>"));

static PAGE_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)<img[^>]+src="(?P<src>[^"]*diglitData[^"]*)""#)
});

static LEVEL_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"/\d+/"));

/// Adapter for `dl.ub.uni-freiburg.de/diglit/{id}`.
#[derive(Debug, Default)]
pub struct FreiburgAdapter;

impl FreiburgAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for FreiburgAdapter {
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
        let id = VIEWER_URL_RE
            .captures(url)
            .map(|caps| caps["id"].to_string())
            .ok_or_else(|| ResolveError::unsupported_source(url))?;

        let landing = ctx.fetch_text(ADAPTER_ID, &format!("{BASE_URL}/diglit/{id}")).await?;
        let title = page_heading(&landing).unwrap_or_else(|| format!("Freiburg Manuscript {id}"));

        let overview = ctx
            .fetch_text(ADAPTER_ID, &format!("{BASE_URL}/diglit/{id}/0001/thumbs"))
            .await?;
        let numbers = page_numbers(&overview, &id);
        if numbers.is_empty() {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                "thumbnail overview links no pages",
            ));
        }
        debug!(id = %id, pages = numbers.len(), "Reading Freiburg page viewers");

        let id = id.as_str();
        let pages: Vec<Option<(String, ImageLocator)>> = stream::iter(numbers)
            .map(move |number| async move {
                let page_url = format!("{BASE_URL}/diglit/{id}/{number}");
                let html = match ctx.fetch_text(ADAPTER_ID, &page_url).await {
                    Ok(html) => html,
                    Err(error) => {
                        warn!(page = %number, error = %error, "Skipping unreadable page viewer");
                        return None;
                    }
                };
                let image = page_image(&html)?;
                let label = number.trim_start_matches('0').to_string();
                Some((format!("Page {label}"), ImageLocator::Direct { url: image }))
            })
            .buffered(PAGE_BATCH)
            .collect()
            .await;

        Manifest::from_ordered(title, Source::new(url, ADAPTER_ID), pages.into_iter().flatten())
    }
}

fn page_heading(html: &str) -> Option<String> {
    let raw = HEADING_RE.captures(html)?.name("text")?.as_str();
    let text = TAG_RE.replace_all(raw, " ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let decoded = decode_html_entities(&collapsed);
    (!decoded.is_empty()).then_some(decoded)
}

/// Four-digit page numbers linked from the overview, in numeric order.
fn page_numbers(html: &str, id: &str) -> Vec<String> {
    let pattern = format!(r"/diglit/{}/(?P<page>\d{{4}})", regex::escape(id));
    let Ok(link_re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    link_re
        .captures_iter(html)
        .map(|caps| caps["page"].to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// The page's `diglitData` image, absolutized and raised to the largest level.
fn page_image(html: &str) -> Option<String> {
    let src = decode_html_entities(PAGE_IMAGE_RE.captures(html)?.name("src")?.as_str());
    let absolute = if src.starts_with("http") {
        src
    } else {
        format!("{BASE_URL}{src}")
    };
    Some(
        LEVEL_SEGMENT_RE
            .replacen(&absolute, 1, MAX_RESOLUTION_LEVEL)
            .into_owned(),
    )
}
