//! Orléans (Aurelia): an Omeka S site whose REST API lists an item's media,
//! each of which names its large derivative.

use std::sync::LazyLock;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "orleans";
const API_BASE_URL: &str = "https://aurelia.orleans.fr/api";
const FILES_BASE_URL: &str = "https://aurelia.orleans.fr/files/large";

/// Media records fetched at once.
const MEDIA_BATCH: usize = 4;

static ITEM_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^https?://aurelia\.orleans\.fr/[^?#]*?/item/(?P<id>\d+)")
});

/// Adapter for Aurelia item pages (`aurelia.orleans.fr/.../item/{id}`).
#[derive(Debug, Default)]
pub struct OrleansAdapter;

impl OrleansAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for OrleansAdapter {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    fn matches(&self, url: &str) -> bool {
        ITEM_URL_RE.is_match(url.trim())
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let url = url.trim();
        let id = ITEM_URL_RE
            .captures(url)
            .map(|caps| caps["id"].to_string())
            .ok_or_else(|| ResolveError::unsupported_source(url))?;

        let item = ctx
            .fetch_json(ADAPTER_ID, &format!("{API_BASE_URL}/items/{id}"))
            .await?;
        let media_ids = media_ids(&item);
        if media_ids.is_empty() {
            return Err(ResolveError::permanent_format(ADAPTER_ID, "item has no media"));
        }

        let images: Vec<Option<String>> = stream::iter(media_ids)
            .map(move |media_id| async move {
                match ctx
                    .fetch_json(ADAPTER_ID, &format!("{API_BASE_URL}/media/{media_id}"))
                    .await
                {
                    Ok(media) => large_image(&media),
                    Err(error) => {
                        warn!(media_id = %media_id, error = %error, "Skipping unreadable media record");
                        None
                    }
                }
            })
            .buffered(MEDIA_BATCH)
            .collect()
            .await;

        let title = item
            .get("o:title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map_or_else(|| format!("Orléans {id}"), str::to_string);
        let pages = images.into_iter().flatten().zip(1u32..).map(|(image, number)| {
            (format!("Page {number}"), ImageLocator::Direct { url: image })
        });
        Manifest::from_ordered(title, Source::new(url, ADAPTER_ID), pages)
    }
}

/// Media ids in display order; references may carry `o:id` or only an `@id` URL.
fn media_ids(item: &Value) -> Vec<String> {
    item.get("o:media")
        .and_then(Value::as_array)
        .map(|media| {
            media
                .iter()
                .filter_map(|reference| {
                    reference
                        .get("o:id")
                        .and_then(|id| {
                            id.as_u64()
                                .map(|id| id.to_string())
                                .or_else(|| id.as_str().map(str::to_string))
                        })
                        .or_else(|| {
                            reference
                                .get("@id")
                                .and_then(Value::as_str)
                                .and_then(|link| link.rsplit('/').next())
                                .filter(|tail| !tail.is_empty())
                                .map(str::to_string)
                        })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn large_image(media: &Value) -> Option<String> {
    media
        .pointer("/thumbnail_display_urls/large")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            let filename = media.get("o:filename").and_then(Value::as_str)?;
            let stem = filename.rsplit_once('.').map_or(filename, |(stem, _)| stem);
            Some(format!("{FILES_BASE_URL}/{stem}.jpg"))
        })
}
