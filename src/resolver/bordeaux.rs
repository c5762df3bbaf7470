//! Bordeaux (Sélène) Deep Zoom pyramids.
//!
//! There is no manifest: page images live at `/in/dz/{base}_{NNNN}.dzi`, and the
//! only way to learn how many pages exist is to request their smallest tile.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::manifest::{ImageLocator, Manifest, Source, TileDescriptor};

use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "bordeaux";
const DZ_BASE_URL: &str = "https://selene.bordeaux.fr/in/dz";

/// Scanning stops after this many consecutive missing pages.
pub const MISS_WINDOW: u32 = 3;
/// Hard ceiling on pages tried for one manuscript.
pub const MAX_SCANNED_PAGES: u32 = 2000;

const TILE_SIZE: u32 = 256;
const TILE_OVERLAP: u32 = 1;
/// Deep enough for 32k-pixel scans; Sélène pages top out around level 13.
const MAX_LEVEL: u32 = 15;

static DIRECT_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r"(?i)selene\.bordeaux\.fr/in/dz/(?P<base>[^/?#]+?)(?:_(?P<page>\d{4}))?(?:\.dzi|_files/[^?#]*)?/?(?:[?#].*)?$",
    )
});

static ARK_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^https?://[^/]*bordeaux\.fr/.*?ark:/\d+/(?P<id>[^/?#]+)(?:/f(?P<page>\d+))?")
});

static IFRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)<iframe[^>]+src=['"](?P<src>[^'"]*selene\.bordeaux\.fr[^'"]+)"#)
});

static DZI_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"/in/dz/(?P<id>[^"'/\s]+?)\.dzi"#));

static PAGE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"^(?P<base>.+?)_(?P<page>\d{4})$"));

/// Adapter for Sélène tile pyramids, addressed directly or through an ARK viewer page.
#[derive(Debug, Default)]
pub struct BordeauxAdapter;

impl BordeauxAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Finds the tile base id and starting page for `url`.
    async fn locate(&self, url: &str, ctx: &ResolveContext) -> Result<(String, u32), ResolveError> {
        if let Some(caps) = DIRECT_URL_RE.captures(url) {
            let page = caps
                .name("page")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(1);
            return Ok((caps["base"].to_string(), page));
        }

        let caps = ARK_URL_RE
            .captures(url)
            .ok_or_else(|| ResolveError::unsupported_source(url))?;
        let start = caps
            .name("page")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1);

        let html = ctx.fetch_text(ADAPTER_ID, url).await?;
        let iframe = IFRAME_RE
            .captures(&html)
            .map(|caps| caps["src"].to_string())
            .ok_or_else(|| {
                ResolveError::permanent_format(ADAPTER_ID, "viewer page embeds no Sélène iframe")
            })?;
        let iframe_url = if iframe.starts_with("http") {
            iframe
        } else if iframe.starts_with("//") {
            format!("https:{iframe}")
        } else {
            format!("https://selene.bordeaux.fr{iframe}")
        };
        debug!(iframe = %iframe_url, "Following Sélène iframe");

        let iframe_html = ctx.fetch_text(ADAPTER_ID, &iframe_url).await?;
        let internal = DZI_REF_RE
            .captures(&iframe_html)
            .map(|caps| caps["id"].to_string())
            .ok_or_else(|| {
                ResolveError::permanent_format(ADAPTER_ID, "Sélène viewer references no .dzi image")
            })?;
        let base = PAGE_SUFFIX_RE
            .captures(&internal)
            .map_or_else(|| internal.clone(), |caps| caps["base"].to_string());
        Ok((base, start))
    }
}

#[async_trait]
impl Adapter for BordeauxAdapter {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    fn matches(&self, url: &str) -> bool {
        let url = url.trim();
        DIRECT_URL_RE.is_match(url) || ARK_URL_RE.is_match(url)
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let url = url.trim();
        let (base, start) = self.locate(url, ctx).await?;
        let found = scan_pages(&base, start, ctx).await;
        if found.is_empty() {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                &format!("no tile pages found for '{base}' starting at page {start}"),
            ));
        }
        info!(base = %base, pages = found.len(), "Discovered Sélène pages");

        // "330636101_MS0778" displays as "MS0778"
        let display = base.split_once('_').map_or(base.as_str(), |(_, rest)| rest);
        let pages = found
            .into_iter()
            .map(|page| (format!("Page {page}"), ImageLocator::Tiled(tile_descriptor(&base, page))));
        Manifest::from_ordered(format!("Bordeaux - {display}"), Source::new(url, ADAPTER_ID), pages)
    }
}

fn page_stem(base: &str, page: u32) -> String {
    format!("{DZ_BASE_URL}/{base}_{page:04}")
}

fn tile_descriptor(base: &str, page: u32) -> TileDescriptor {
    TileDescriptor {
        url_template: format!("{}_files/{{level}}/{{col}}_{{row}}.jpg", page_stem(base, page)),
        tile_size: TILE_SIZE,
        max_level: Some(MAX_LEVEL),
        min_level: 0,
        overlap: TILE_OVERLAP,
        format: "jpg".to_string(),
    }
}

/// Walks pages upward from `start` until [`MISS_WINDOW`] consecutive
/// pages are missing or [`MAX_SCANNED_PAGES`] have been tried.
async fn scan_pages(base: &str, start: u32, ctx: &ResolveContext) -> Vec<u32> {
    let mut found = Vec::new();
    let mut misses = 0;
    let mut page = start.max(1);
    let mut scanned = 0;
    while misses < MISS_WINDOW && scanned < MAX_SCANNED_PAGES {
        let first_tile = format!("{}_files/0/0_0.jpg", page_stem(base, page));
        if ctx.exists(&first_tile).await {
            found.push(page);
            misses = 0;
        } else {
            misses += 1;
        }
        page += 1;
        scanned += 1;
    }
    found
}
