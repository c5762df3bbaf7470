//! Wolfenbüttel (HAB digital library): image names are collected from the
//! paginated `thumbs.php` overview, following its "forward" link.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "wolfenbuettel";
const BASE_URL: &str = "https://diglib.hab.de";

/// Overview pages followed before giving up on a runaway pointer chain.
const MAX_THUMB_PAGES: usize = 200;

static DIR_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)diglib\.hab\.de/[^#]*?[?&]dir=(?P<dir>mss/[^&#]+)"));

static DIR_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)diglib\.hab\.de/(?P<dir>(?:mss|varia|drucke)/[^/?#]+(?:/[^/?#]+)?)")
});

static IMAGE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"image=(?P<name>[^'"&]+)"#));

static FORWARD_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r#"href="thumbs\.php\?dir=[^&"]+&(?:amp;)?pointer=(?P<pointer>\d+)"[^>]*>\s*<img[^>]*title="forward""#,
    )
});

/// Adapter for HAB manuscripts addressed by `?dir=mss/...` or by path.
#[derive(Debug, Default)]
pub struct WolfenbuettelAdapter;

impl WolfenbuettelAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for WolfenbuettelAdapter {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    fn matches(&self, url: &str) -> bool {
        manuscript_dir(url).is_some()
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let url = url.trim();
        let dir = manuscript_dir(url).ok_or_else(|| ResolveError::unsupported_source(url))?;

        let mut names: Vec<String> = Vec::new();
        let mut seen_names = HashSet::new();
        let mut visited = HashSet::new();
        let mut pointer = 0u32;
        while visited.insert(pointer) && visited.len() <= MAX_THUMB_PAGES {
            let thumbs_url = format!("{BASE_URL}/thumbs.php?dir={dir}&pointer={pointer}");
            let html = match ctx.fetch_text(ADAPTER_ID, &thumbs_url).await {
                Ok(html) => html,
                // Later overview pages are a bonus; the first one is required.
                Err(error) if !names.is_empty() => {
                    warn!(pointer, error = %error, "Stopping at unreadable thumbnail page");
                    break;
                }
                Err(error) => return Err(error),
            };
            let before = names.len();
            for caps in IMAGE_NAME_RE.captures_iter(&html) {
                let name = caps["name"].to_string();
                if seen_names.insert(name.clone()) {
                    names.push(name);
                }
            }
            if names.len() == before {
                break;
            }
            match FORWARD_RE
                .captures(&html)
                .and_then(|caps| caps["pointer"].parse::<u32>().ok())
            {
                Some(next) => pointer = next,
                None => break,
            }
        }
        debug!(dir = %dir, pages = names.len(), "Collected HAB image names");
        if names.is_empty() {
            return Err(ResolveError::permanent_format(
                ADAPTER_ID,
                &format!("no page images listed for '{dir}'"),
            ));
        }

        let shelfmark = dir.strip_prefix("mss/").unwrap_or(&dir);
        let pages = names.into_iter().map(|name| {
            let url = format!("{BASE_URL}/{dir}/max/{name}.jpg");
            (name, ImageLocator::Direct { url })
        });
        Manifest::from_ordered(
            format!("Wolfenbüttel HAB MS {shelfmark}"),
            Source::new(url, ADAPTER_ID),
            pages,
        )
    }
}

/// Image directory for a HAB URL, always rooted at its collection (`mss/...`).
fn manuscript_dir(url: &str) -> Option<String> {
    let url = url.trim();
    if let Some(caps) = DIR_PARAM_RE.captures(url) {
        return Some(caps["dir"].to_string());
    }
    DIR_PATH_RE
        .captures(url)
        .map(|caps| caps["dir"].trim_end_matches("/start.htm").to_string())
        .filter(|dir| !dir.ends_with(".php"))
}
