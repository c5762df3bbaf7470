//! Morgan Library & Museum: facsimile images scraped from the collection's
//! thumbnail page, or from the ICA catalogue's thumbnail listing.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "morgan";
const SITE_URL: &str = "https://www.themorgan.org";
const ICA_URL: &str = "https://ica.themorgan.org";

static COLLECTION_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r"(?i)^https?://(?:www\.)?themorgan\.org/collection/(?P<slug>[a-z0-9][a-z0-9_-]*)(?:/(?P<object>\d+))?",
    )
});

static ICA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^https?://ica\.themorgan\.org/manuscript/(?:thumbs|page/\d+)/(?P<id>\d+)")
});

static FACSIMILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"/facsimile/(?P<bbid>\d+)/(?P<name>[^"'?/\s]+)\.jpg"#)
});

static ICA_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"icaimages/\d+/[^"'\s]+?\.jpg"#));

/// Adapter for `themorgan.org/collection/{slug}[/{object}]` and ICA thumbnail pages.
#[derive(Debug, Default)]
pub struct MorganAdapter;

impl MorganAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for MorganAdapter {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    fn matches(&self, url: &str) -> bool {
        let url = url.trim();
        COLLECTION_URL_RE.is_match(url) || ICA_URL_RE.is_match(url)
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let url = url.trim();
        let (title, images) = if let Some(caps) = ICA_URL_RE.captures(url) {
            let id = &caps["id"];
            let html = ctx
                .fetch_text(ADAPTER_ID, &format!("{ICA_URL}/manuscript/thumbs/{id}"))
                .await?;
            (format!("Morgan ICA Manuscript {id}"), ica_images(&html))
        } else {
            let caps = COLLECTION_URL_RE
                .captures(url)
                .ok_or_else(|| ResolveError::unsupported_source(url))?;
            let slug = &caps["slug"];
            let collection = match caps.name("object") {
                Some(object) => format!("{SITE_URL}/collection/{slug}/{}", object.as_str()),
                None => format!("{SITE_URL}/collection/{slug}"),
            };
            let html = match ctx.fetch_text(ADAPTER_ID, &format!("{collection}/thumbs")).await {
                Ok(html) => html,
                Err(error) if !error.is_transient() => {
                    debug!(error = %error, "No thumbnail page; reading the collection page");
                    ctx.fetch_text(ADAPTER_ID, &collection).await?
                }
                Err(error) => return Err(error),
            };
            (display_slug(slug), facsimile_images(&html))
        };

        if images.is_empty() {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                "page references no facsimile images",
            ));
        }
        let pages = images.into_iter().zip(1u32..).map(|(image, number)| {
            (format!("Page {number}"), ImageLocator::Direct { url: image })
        });
        Manifest::from_ordered(title, Source::new(url, ADAPTER_ID), pages)
    }
}

/// Full-size facsimiles for every thumbnail, styled or not, in page order.
fn facsimile_images(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    FACSIMILE_RE
        .captures_iter(html)
        .map(|caps| {
            format!(
                "{SITE_URL}/sites/default/files/facsimile/{}/{}.jpg",
                &caps["bbid"], &caps["name"]
            )
        })
        .filter(|image| seen.insert(image.clone()))
        .collect()
}

fn ica_images(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    ICA_IMAGE_RE
        .find_iter(html)
        .map(|found| format!("{ICA_URL}/{}", found.as_str()))
        .filter(|image| seen.insert(image.clone()))
        .collect()
}

/// `lindau-gospels` displays as `Lindau Gospels`.
fn display_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}
