//! IIIF Presentation manifest parsing (v2 and v3) and the generic IIIF adapter.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::manifest::{ImageLocator, Manifest, Source};

use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

static MANIFEST_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)^https?://[^\s?#]+/manifest(?:\.json)?/?(?:[?#].*)?$")
});

static IIIF_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)^https?://[^\s?#]*/iiif/[^\s?#]*manifest"));

const UNTITLED: &str = "Untitled manuscript";

/// Catch-all adapter for URLs that point straight at a IIIF manifest.
#[derive(Debug, Default)]
pub struct IiifAdapter;

impl IiifAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for IiifAdapter {
    fn id(&self) -> &'static str {
        "iiif"
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Generic
    }

    fn matches(&self, url: &str) -> bool {
        looks_like_manifest_url(url)
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let document = ctx.fetch_json(self.id(), url.trim()).await?;
        parse_iiif_manifest(&document, Source::new(url, self.id()))
    }
}

/// True for URLs that point straight at a manifest document.
pub(super) fn looks_like_manifest_url(url: &str) -> bool {
    let url = url.trim();
    MANIFEST_PATH_RE.is_match(url) || IIIF_SEGMENT_RE.is_match(url)
}

/// Converts a IIIF Presentation v2 or v3 document into a [`Manifest`].
///
/// Canvases without a usable image are skipped and the rest re-indexed.
///
/// # Errors
///
/// Returns [`ResolveError::PermanentFormat`] when the document is neither
/// version or yields no pages.
pub fn parse_iiif_manifest(document: &Value, source: Source) -> Result<Manifest, ResolveError> {
    let adapter = source.adapter_id.clone();
    let canvases = if let Some(sequences) = document.get("sequences") {
        let canvases = sequences
            .get(0)
            .and_then(|sequence| sequence.get("canvases"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ResolveError::permanent_format(&adapter, "IIIF v2 manifest has no sequences[0].canvases")
            })?;
        canvases.iter().map(v2_canvas_image).zip(canvases).collect::<Vec<_>>()
    } else if let Some(items) = document.get("items").and_then(Value::as_array) {
        items.iter().map(v3_canvas_image).zip(items).collect::<Vec<_>>()
    } else {
        return Err(ResolveError::permanent_format(
            &adapter,
            "document is not a IIIF Presentation manifest (no sequences or items)",
        ));
    };

    let total = canvases.len();
    let pages: Vec<(String, ImageLocator)> = canvases
        .into_iter()
        .filter_map(|(image, canvas)| {
            if image.is_none() {
                debug!(canvas = ?canvas.get("@id").or_else(|| canvas.get("id")), "Skipping canvas without image");
            }
            image.map(|url| (canvas.get("label").and_then(label_text), url))
        })
        .zip(1u32..)
        .map(|((label, url), index)| {
            (
                label.unwrap_or_else(|| format!("Page {index}")),
                ImageLocator::Direct { url },
            )
        })
        .collect();

    if pages.len() < total {
        warn!(
            skipped = total - pages.len(),
            total, "Some canvases had no usable image"
        );
    }

    let title = document
        .get("label")
        .and_then(label_text)
        .unwrap_or_else(|| UNTITLED.to_string());
    Manifest::from_ordered(title, source, pages)
}

/// Image URL for a v2 canvas: `images[0].resource`, preferring its service.
fn v2_canvas_image(canvas: &Value) -> Option<String> {
    let resource = canvas.get("images")?.get(0)?.get("resource")?;
    image_from_body(resource)
}

/// Image URL for a v3 canvas: `items[0].items[0].body`.
fn v3_canvas_image(canvas: &Value) -> Option<String> {
    let body = canvas
        .get("items")?
        .get(0)?
        .get("items")?
        .get(0)?
        .get("body")?;
    let body = if body.is_array() { body.get(0)? } else { body };
    image_from_body(body)
}

fn image_from_body(body: &Value) -> Option<String> {
    if let Some(service) = body.get("service").and_then(best_service) {
        return Some(format!(
            "{}/full/max/0/default.jpg",
            service.trim_end_matches('/')
        ));
    }
    body.get("@id")
        .or_else(|| body.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Picks the service allowing the largest image: Image API 3 first, then any with an id.
fn best_service(service: &Value) -> Option<String> {
    let candidates: Vec<&Value> = match service {
        Value::Array(list) => list.iter().collect(),
        Value::Object(_) => vec![service],
        _ => Vec::new(),
    };
    let id_of = |svc: &Value| {
        svc.get("id")
            .or_else(|| svc.get("@id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let is_v3 = |svc: &&Value| {
        svc.get("type")
            .or_else(|| svc.get("@type"))
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.contains("ImageService3"))
    };
    candidates
        .iter()
        .copied()
        .filter(is_v3)
        .find_map(id_of)
        .or_else(|| candidates.iter().copied().find_map(id_of))
}

/// Flattens IIIF label forms: strings, `@value` objects, arrays, and language maps
/// (`none`, then `en`, then whichever language comes first).
fn label_text(label: &Value) -> Option<String> {
    let text = match label {
        Value::String(text) => Some(text.clone()),
        Value::Array(values) => values.iter().find_map(label_text),
        Value::Object(map) => {
            if let Some(value) = map.get("@value") {
                label_text(value)
            } else {
                ["none", "en"]
                    .iter()
                    .find_map(|lang| map.get(*lang).and_then(label_text))
                    .or_else(|| map.values().find_map(label_text))
            }
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
