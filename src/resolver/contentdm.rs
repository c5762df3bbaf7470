//! ContentDM compound objects (Florence BML and other CONTENTdm hosts).
//!
//! The viewer embeds its state as `window.__INITIAL_STATE__ = JSON.parse("...")`.
//! A compound object is a parent with one child per page; a child URL points at
//! one page, so the page list comes from the parent's children.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

const ADAPTER_ID: &str = "contentdm";

/// CONTENTdm image servers throttle hard above a few parallel requests.
const CONTENTDM_CONCURRENCY_CAP: usize = 3;

/// Children whose label contains one of these are bindings or calibration shots.
const NON_CONTENT_LABELS: [&str; 6] = [
    "color chart",
    "dorso",
    "piatto",
    "controguardia",
    "guardia anteriore",
    "guardia posteriore",
];

static VIEWER_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^(?P<origin>https?://[^/?#]+)/digital/collection/(?P<coll>[^/?#]+)/id/(?P<id>\d+)")
});

static INITIAL_STATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"window\.__INITIAL_STATE__\s*=\s*JSON\.parse\("(.+?)"\);"#)
});

#[derive(Debug)]
struct ViewerUrl {
    origin: String,
    collection: String,
    id: String,
}

impl ViewerUrl {
    fn parse(url: &str) -> Option<Self> {
        let caps = VIEWER_URL_RE.captures(url.trim())?;
        Some(Self {
            origin: caps["origin"].to_string(),
            collection: caps["coll"].to_string(),
            id: caps["id"].to_string(),
        })
    }

    fn page_url(&self, id: &str) -> String {
        format!("{}/digital/collection/{}/id/{id}", self.origin, self.collection)
    }

    fn image_url(&self, id: &str) -> String {
        format!(
            "{}/iiif/2/{}:{id}/full/max/0/default.jpg",
            self.origin, self.collection
        )
    }
}

/// Adapter for CONTENTdm viewer URLs (`/digital/collection/{coll}/id/{id}`).
#[derive(Debug, Default)]
pub struct ContentDmAdapter;

impl ContentDmAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn load_state(&self, url: &str, ctx: &ResolveContext) -> Result<Value, ResolveError> {
        let html = ctx.fetch_text(ADAPTER_ID, url).await?;
        parse_initial_state(&html)
    }
}

#[async_trait]
impl Adapter for ContentDmAdapter {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    fn matches(&self, url: &str) -> bool {
        VIEWER_URL_RE.is_match(url.trim())
    }

    fn concurrency_cap(&self) -> Option<usize> {
        Some(CONTENTDM_CONCURRENCY_CAP)
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let viewer =
            ViewerUrl::parse(url).ok_or_else(|| ResolveError::unsupported_source(url))?;
        let state = self.load_state(url.trim(), ctx).await?;
        let item = state
            .pointer("/item/item")
            .ok_or_else(|| ResolveError::permanent_format(ADAPTER_ID, "page state has no item.item"))?;

        let parent_id = item.get("parentId").and_then(id_string).filter(|id| id != "-1");
        let (children, title_source) = if let Some(parent_id) = parent_id {
            if let Some(parent) = item.get("parent").filter(|p| p.get("children").is_some()) {
                (children_of(parent), parent.clone())
            } else {
                debug!(parent_id = %parent_id, "Fetching compound parent page");
                let parent_state = self.load_state(&viewer.page_url(&parent_id), ctx).await?;
                let parent_children = parent_state
                    .pointer("/item/children")
                    .map(children_array)
                    .unwrap_or_default();
                let parent_item = parent_state.pointer("/item/item").cloned().unwrap_or(Value::Null);
                (parent_children, parent_item)
            }
        } else {
            let children = state
                .pointer("/item/children")
                .map(children_array)
                .unwrap_or_default();
            (children, item.clone())
        };

        let pages: Vec<(String, ImageLocator)> = if children.is_empty() {
            let label = item
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("Page 1")
                .to_string();
            vec![(
                label,
                ImageLocator::Direct {
                    url: viewer.image_url(&viewer.id),
                },
            )]
        } else {
            children
                .iter()
                .filter(|(_, label)| is_content_page(label.as_deref()))
                .map(|(id, label)| {
                    (
                        label.clone().unwrap_or_else(|| format!("Page {id}")),
                        ImageLocator::Direct {
                            url: viewer.image_url(id),
                        },
                    )
                })
                .collect()
        };

        let title = manuscript_title(&title_source)
            .or_else(|| item.get("title").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("{} {}", viewer.collection, viewer.id));
        Manifest::from_ordered(title, Source::new(url, ADAPTER_ID), pages)
    }
}

/// Extracts and decodes the embedded viewer state.
fn parse_initial_state(html: &str) -> Result<Value, ResolveError> {
    let literal = INITIAL_STATE_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| {
            ResolveError::permanent_format(ADAPTER_ID, "viewer page has no __INITIAL_STATE__")
        })?;
    let json = unescape_js_string(literal.as_str());
    serde_json::from_str(&json).map_err(|error| {
        ResolveError::permanent_format(ADAPTER_ID, &format!("viewer state is not valid JSON: {error}"))
    })
}

/// Decodes the escapes a JS double-quoted string literal may contain.
fn unescape_js_string(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn children_of(node: &Value) -> Vec<(String, Option<String>)> {
    node.get("children").map(children_array).unwrap_or_default()
}

fn children_array(children: &Value) -> Vec<(String, Option<String>)> {
    children
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|child| {
                    let id = child.get("id").and_then(id_string)?;
                    let label = child
                        .get("title")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|label| !label.is_empty())
                        .map(str::to_string);
                    Some((id, label))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn is_content_page(label: Option<&str>) -> bool {
    let Some(label) = label else {
        return true;
    };
    let lower = label.to_lowercase();
    !NON_CONTENT_LABELS.iter().any(|skip| lower.contains(skip))
}

/// Title from the record's metadata fields: subject plus short title, else
/// identifier, else the title field.
fn manuscript_title(node: &Value) -> Option<String> {
    let fields = node.get("fields")?.as_array()?;
    let field = |keys: &[&str]| {
        fields.iter().find_map(|field| {
            let key = field.get("key")?.as_str()?;
            if !keys.contains(&key) {
                return None;
            }
            field
                .get("value")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
    };
    let title = field(&["title", "titlea"]);
    if let Some(subject) = field(&["subjec"]) {
        return Some(match title {
            Some(title) => {
                let short: String = title
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .chars()
                    .take(50)
                    .collect();
                format!("{subject} - {short}")
            }
            None => subject,
        });
    }
    field(&["identi"]).or_else(|| title.map(|t| t.chars().take(80).collect()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::test_support::MockFetcher;

    const CHILD_URL: &str = "https://cdm21059.contentdm.oclc.org/digital/collection/plutei/id/318";

    fn viewer_html(state: &Value) -> String {
        let encoded = serde_json::to_string(&state.to_string()).unwrap();
        format!(
            "<html><script>window.__INITIAL_STATE__ = JSON.parse({encoded});</script></html>"
        )
    }

    fn image_urls(manifest: &Manifest) -> Vec<String> {
        manifest
            .pages()
            .iter()
            .map(|page| match &page.locator {
                ImageLocator::Direct { url } => url.clone(),
                ImageLocator::Tiled(_) => panic!("tiled"),
            })
            .collect()
    }

    // ==================== State Parsing Tests ====================

    #[test]
    fn test_unescape_js_string() {
        assert_eq!(
            unescape_js_string(r#"{\"a\":\"x&y\\/z\"}"#),
            r#"{"a":"x&y\/z"}"#
        );
        assert_eq!(unescape_js_string(r"tail\"), "tail\\");
    }

    #[test]
    fn test_parse_initial_state_missing() {
        assert!(matches!(
            parse_initial_state("<html></html>"),
            Err(ResolveError::PermanentFormat { .. })
        ));
    }

    #[test]
    fn test_is_content_page_filters_bindings() {
        assert!(!is_content_page(Some("Color Chart")));
        assert!(!is_content_page(Some("Piatto anteriore")));
        assert!(!is_content_page(Some("Guardia anteriore I")));
        assert!(is_content_page(Some("c. 1r")));
        assert!(is_content_page(None));
    }

    // ==================== Adapter Tests ====================

    #[tokio::test]
    async fn test_child_url_uses_parent_children() {
        let state = json!({"item": {"item": {
            "id": 318,
            "parentId": 400,
            "title": "c. 1r",
            "parent": {
                "fields": [
                    {"key": "subjec", "value": "Plut.16.22"},
                    {"key": "title", "value": "Evangelia. Codex membranaceus"}
                ],
                "children": [
                    {"id": 310, "title": "Dorso"},
                    {"id": 311, "title": "Color chart"},
                    {"id": 318, "title": "c. 1r"},
                    {"id": 319, "title": "c. 1v"},
                    {"id": 320, "title": "Piatto posteriore"}
                ]
            }
        }}});
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(CHILD_URL, MockFetcher::text(&viewer_html(&state)));
        let ctx = ResolveContext::new(fetcher);

        let manifest = ContentDmAdapter::new().resolve(CHILD_URL, &ctx).await.unwrap();
        assert_eq!(manifest.title(), "Plut.16.22 - Evangelia");
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.pages()[1].label, "c. 1v");
        assert_eq!(
            image_urls(&manifest)[0],
            "https://cdm21059.contentdm.oclc.org/iiif/2/plutei:318/full/max/0/default.jpg"
        );
    }

    #[tokio::test]
    async fn test_parent_fetched_when_not_embedded() {
        let child = json!({"item": {"item": {"id": 318, "parentId": "400"}}});
        let parent = json!({"item": {
            "item": {"id": 400, "fields": [{"key": "identi", "value": "Plut.1.1"}]},
            "children": [{"id": 401, "title": "c. 1r"}, {"id": 402}]
        }});
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(CHILD_URL, MockFetcher::text(&viewer_html(&child)));
        fetcher.respond(
            "https://cdm21059.contentdm.oclc.org/digital/collection/plutei/id/400",
            MockFetcher::text(&viewer_html(&parent)),
        );
        let ctx = ResolveContext::new(fetcher);

        let manifest = ContentDmAdapter::new().resolve(CHILD_URL, &ctx).await.unwrap();
        assert_eq!(manifest.title(), "Plut.1.1");
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.pages()[1].label, "Page 402");
    }

    #[tokio::test]
    async fn test_single_item_without_children() {
        let state = json!({"item": {"item": {"id": 318, "parentId": -1, "title": "Foglio sciolto"}}});
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(CHILD_URL, MockFetcher::text(&viewer_html(&state)));
        let ctx = ResolveContext::new(fetcher);

        let manifest = ContentDmAdapter::new().resolve(CHILD_URL, &ctx).await.unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.title(), "Foglio sciolto");
        assert!(image_urls(&manifest)[0].contains("plutei:318"));
    }

    #[test]
    fn test_concurrency_cap() {
        assert_eq!(ContentDmAdapter::new().concurrency_cap(), Some(3));
    }
}
