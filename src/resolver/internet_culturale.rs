//! Internet Culturale: the MAG metadata XML served by the viewer's `magparser`
//! endpoint lists every page image.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::fetch::FetchOptions;
use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::{compile_static_regex, decode_html_entities};
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "internet-culturale";
const JMMS_BASE_URL: &str = "https://www.internetculturale.it/jmms/";

static VIEWER_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^https?://(?:www\.)?internetculturale\.it/[^#]*?[?&]id=[^&#]+")
});

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?s)<info key="Titolo">\s*<value>(?P<title>.*?)</value>"#)
});

static PAGE_SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"<page[^>]+src="(?P<src>[^"]+)""#));

static CACHEMAN_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#""(?P<src>[^"]*cacheman[^"]*\.jpe?g)""#));

/// Adapter for Internet Culturale viewer links carrying an OAI `id` and a `teca`.
#[derive(Debug, Default)]
pub struct InternetCulturaleAdapter;

impl InternetCulturaleAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for InternetCulturaleAdapter {
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
        let parsed = Url::parse(url).map_err(|_| ResolveError::unsupported_source(url))?;
        let query_value = |name: &str| {
            parsed
                .query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
                .filter(|value| !value.is_empty())
        };
        let oai_id = query_value("id").ok_or_else(|| ResolveError::unsupported_source(url))?;
        let teca = query_value("teca");

        // The magparser endpoint expects the session cookie the viewer hands out.
        if let Err(error) = ctx.fetch(ADAPTER_ID, url, &FetchOptions::default()).await {
            debug!(error = %error, "Viewer visit failed; requesting MAG data anyway");
        }

        let mag_url = format!(
            "{JMMS_BASE_URL}magparser?id={}&teca={}&mode=all&fulltext=0",
            urlencoding::encode(&oai_id),
            urlencoding::encode(teca.as_deref().unwrap_or("Unknown")),
        );
        let options = FetchOptions::default()
            .with_header("Referer", url)
            .with_header("X-Requested-With", "XMLHttpRequest");
        let xml = ctx.fetch(ADAPTER_ID, &mag_url, &options).await?.text();

        let images = page_images(&xml);
        if images.is_empty() {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                "MAG data lists no page images",
            ));
        }

        let mut title = TITLE_RE
            .captures(&xml)
            .map(|caps| decode_html_entities(caps["title"].trim()))
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| {
                oai_id
                    .rsplit(':')
                    .next()
                    .unwrap_or(&oai_id)
                    .replace('%', " ")
                    .trim()
                    .to_string()
            });
        if let Some(teca) = &teca {
            title = format!("{title} ({teca})");
        }

        let pages = images.into_iter().zip(1u32..).map(|(image, number)| {
            (format!("Page {number}"), ImageLocator::Direct { url: image })
        });
        Manifest::from_ordered(title, Source::new(url, ADAPTER_ID), pages)
    }
}

/// Full-size page image URLs in document order, first occurrence wins.
fn page_images(xml: &str) -> Vec<String> {
    let mut sources: Vec<&str> = PAGE_SRC_RE
        .captures_iter(xml)
        .filter_map(|caps| caps.name("src").map(|m| m.as_str()))
        .filter(|src| is_jpeg(src))
        .collect();
    if sources.is_empty() {
        sources = CACHEMAN_RE
            .captures_iter(xml)
            .filter_map(|caps| caps.name("src").map(|m| m.as_str()))
            .collect();
    }

    let mut seen = HashSet::new();
    sources
        .into_iter()
        .map(|src| {
            let src = src.replace("cacheman/web/", "cacheman/normal/");
            if src.starts_with("http://") || src.starts_with("https://") {
                src
            } else {
                format!("{JMMS_BASE_URL}{}", src.trim_start_matches('/'))
            }
        })
        .filter(|image| seen.insert(image.clone()))
        .collect()
}

fn is_jpeg(src: &str) -> bool {
    let lower = src.to_ascii_lowercase();
    lower.contains(".jpg") || lower.contains(".jpeg")
}
