//! MDC (Memòria Digital de Catalunya): compound objects described by the
//! `utils/getfile` XML, served through the site's IIIF image endpoint.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::fetch::FetchOptions;
use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::{compile_static_regex, decode_html_entities};
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "mdc-catalonia";
const BASE_URL: &str = "https://mdc.csuc.cat";

static VIEWER_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^https?://mdc\.csuc\.cat/digital/collection/(?P<coll>[^/?#]+)/id/(?P<id>\d+)")
});

static PAGE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?s)<page>(?P<body>.*?)</page>"));

static PAGE_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?s)<pagetitle>(?P<v>.*?)</pagetitle>"));

static PAGE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?s)<pagefile>(?P<v>.*?)</pagefile>"));

static PAGE_PTR_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"<pageptr>\s*(?P<v>\d+)\s*</pageptr>"));

/// Adapter for `mdc.csuc.cat/digital/collection/{coll}/id/{id}`.
///
/// Registered ahead of the generic ContentDM adapter, which would otherwise
/// claim the same URL shape.
#[derive(Debug, Default)]
pub struct MdcCataloniaAdapter;

impl MdcCataloniaAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for MdcCataloniaAdapter {
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
        let collection = caps["coll"].to_string();
        let id = caps["id"].to_string();

        let xml_url = format!("{BASE_URL}/utils/getfile/collection/{collection}/id/{id}");
        let options = FetchOptions::default().with_header("Referer", url);
        let xml = ctx.fetch(ADAPTER_ID, &xml_url, &options).await?.text();

        let pages: Vec<(String, ImageLocator)> = compound_pages(&xml)
            .into_iter()
            .map(|page| {
                (
                    page.title,
                    ImageLocator::Direct {
                        url: format!(
                            "{BASE_URL}/digital/iiif/{collection}/{}/full/full/0/default.jpg",
                            page.pointer
                        ),
                    },
                )
            })
            .collect();
        if pages.is_empty() {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                "compound object XML lists no pages",
            ));
        }
        Manifest::from_ordered(
            format!("MDC Catalonia {collection} {id}"),
            Source::new(url, ADAPTER_ID),
            pages,
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
struct CompoundPage {
    title: String,
    pointer: String,
}

/// Pages missing a title, file, or pointer are skipped.
fn compound_pages(xml: &str) -> Vec<CompoundPage> {
    PAGE_BLOCK_RE
        .captures_iter(xml)
        .filter_map(|block| {
            let body = block.name("body")?.as_str();
            let title = PAGE_TITLE_RE.captures(body)?["v"].trim().to_string();
            PAGE_FILE_RE.captures(body)?;
            let pointer = PAGE_PTR_RE.captures(body)?["v"].to_string();
            Some(CompoundPage {
                title: decode_html_entities(&title),
                pointer,
            })
        })
        .collect()
}
