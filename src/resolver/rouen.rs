//! Rouen (Rotomagus): Gallica-style ARK viewer without a IIIF manifest.
//!
//! The viewer's JSON descriptor states the page count somewhere in a deeply
//! nested fragment tree; page images are `/f{n}.highres` under the ARK.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::fetch::FetchOptions;
use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "rouen";
const ARK_BASE_URL: &str = "https://www.rotomagus.fr/ark:/12148";

const PAGE_COUNT_KEYS: [&str; 2] = ["totalNumberPage", "totalVues"];
const TITLE_KEYS: [&str; 5] = ["title", "label", "nom", "libelle", "intitule"];

static VIEWER_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^https?://(?:www\.)?rotomagus\.fr/[^#]*?ark:/12148/(?P<id>[^/?#\s]+)")
});

static VIEWER_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"["']?(?:totalNumberPage|totalVues|nbTotalVues)["']?\s*:\s*(?P<count>\d+)"#)
});

/// Adapter for `rotomagus.fr/ark:/12148/{id}` viewer links.
#[derive(Debug, Default)]
pub struct RouenAdapter;

impl RouenAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for RouenAdapter {
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

        let descriptor_url = format!("{ARK_BASE_URL}/{id}/manifest.json");
        let options = FetchOptions::default().with_header("Referer", url);
        let descriptor = match ctx.fetch(ADAPTER_ID, &descriptor_url, &options).await {
            Ok(response) => serde_json::from_slice::<Value>(&response.body).ok(),
            Err(error) => {
                warn!(id = %id, error = %error, "Rouen descriptor unavailable; reading viewer page");
                None
            }
        };

        let mut title = None;
        let mut count = None;
        if let Some(descriptor) = &descriptor {
            count = find_page_count(descriptor);
            if count.is_some() {
                title = find_title(descriptor);
            }
        }
        if count.is_none() {
            let viewer_url = format!("{ARK_BASE_URL}/{id}/f1.item.zoom");
            debug!(viewer_url = %viewer_url, "Reading page count from viewer");
            let html = ctx.fetch_text(ADAPTER_ID, &viewer_url).await?;
            count = VIEWER_COUNT_RE
                .captures(&html)
                .and_then(|caps| caps["count"].parse::<u32>().ok())
                .filter(|count| *count > 0);
        }
        let count = count.ok_or_else(|| {
            ResolveError::permanent_format(ADAPTER_ID, &format!("no page count found for '{id}'"))
        })?;

        let title = title.unwrap_or_else(|| format!("Rouen Manuscript {id}"));
        let pages = (1..=count).map(|page| {
            (
                format!("f{page}"),
                ImageLocator::Direct {
                    url: format!("{ARK_BASE_URL}/{id}/f{page}.highres"),
                },
            )
        });
        Manifest::from_ordered(title, Source::new(url, ADAPTER_ID), pages)
    }
}

/// First positive page count anywhere in the descriptor, depth first.
fn find_page_count(value: &Value) -> Option<u32> {
    match value {
        Value::Object(map) => {
            for key in PAGE_COUNT_KEYS {
                if let Some(count) = map
                    .get(key)
                    .and_then(Value::as_u64)
                    .filter(|count| *count > 0)
                    .and_then(|count| u32::try_from(count).ok())
                {
                    return Some(count);
                }
            }
            map.values().find_map(find_page_count)
        }
        Value::Array(items) => items.iter().find_map(find_page_count),
        _ => None,
    }
}

fn find_title(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => TITLE_KEYS
            .iter()
            .find_map(|key| {
                map.get(*key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|title| !title.is_empty())
                    .map(str::to_string)
            })
            .or_else(|| map.values().find_map(find_title)),
        Value::Array(items) => items.iter().find_map(find_title),
        _ => None,
    }
}
