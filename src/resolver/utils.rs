//! Shared helpers for adapters: URL normalization, static regexes, HTML scraps.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Compiles a regex at static init; panics on invalid pattern.
pub fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

static HTML_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<title[^>]*>(.*?)</title>"));

/// Cache key for a source URL.
///
/// Trims, drops the fragment and any trailing `/`, percent-decodes and
/// lowercases, so cosmetic variants of one viewer link share a cache entry.
#[must_use]
pub fn normalize_source_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split_once('#').map_or(trimmed, |(head, _)| head);
    let without_slash = without_fragment.trim_end_matches('/');
    let decoded = urlencoding::decode(without_slash)
        .map_or_else(|_| without_slash.to_string(), std::borrow::Cow::into_owned);
    decoded.to_lowercase()
}

/// Normalizes a host string: trim, strip leading "www.", trailing '.', and lowercases.
#[must_use]
pub fn canonical_host(host: &str) -> String {
    host.trim()
        .trim_start_matches("www.")
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Canonical host of `url`, or `None` when it does not parse.
#[must_use]
pub fn url_host(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()
        .and_then(|parsed| parsed.host_str().map(canonical_host))
}

/// `scheme://host[:port]` of `url`.
#[must_use]
pub fn url_origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// Resolves a possibly relative URL string against a base URL.
///
/// Returns the value as-is if it already starts with `http://` or `https://`;
/// normalizes `//...` to `https:...`; otherwise joins with `base_url`.
#[must_use]
pub fn absolutize_url(value: &str, base_url: &Url) -> Option<String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    if value.starts_with("//") {
        return Some(format!("https:{value}"));
    }
    base_url.join(value).ok().map(|url| url.to_string())
}

/// Contents of the first `<title>` element, entity-decoded and whitespace-collapsed.
#[must_use]
pub fn html_title(html: &str) -> Option<String> {
    let raw = HTML_TITLE_RE.captures(html)?.get(1)?.as_str();
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let decoded = decode_html_entities(&collapsed);
    (!decoded.is_empty()).then_some(decoded)
}

/// Decodes the handful of named and numeric entities library pages use in titles.
#[must_use]
pub fn decode_html_entities(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';').filter(|end| *end <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        if let Some(ch) = decoded {
            out.push(ch);
            rest = &tail[end + 1..];
        } else {
            out.push('&');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Normalization Tests ====================

    #[test]
    fn test_normalize_source_url_collapses_cosmetic_variants() {
        let base = normalize_source_url("https://digi.vatlib.it/view/MSS_Vat.lat.3225");
        assert_eq!(
            normalize_source_url("  https://digi.vatlib.it/view/MSS_Vat.lat.3225/  "),
            base
        );
        assert_eq!(
            normalize_source_url("https://DIGI.vatlib.it/view/MSS_Vat.lat.3225#page=4"),
            base
        );
        assert_eq!(
            normalize_source_url("https://digi.vatlib.it/view/MSS%5FVat.lat.3225"),
            base
        );
    }

    #[test]
    fn test_normalize_source_url_keeps_query() {
        assert_ne!(
            normalize_source_url("https://h/v?PPN=PPN1"),
            normalize_source_url("https://h/v?PPN=PPN2")
        );
    }

    #[test]
    fn test_canonical_host_trim_www_and_trailing_dot_lowercase() {
        assert_eq!(canonical_host("  www.Example.COM.  "), "example.com");
        assert_eq!(canonical_host("digi.vatlib.it"), "digi.vatlib.it");
    }

    #[test]
    fn test_url_host_and_origin() {
        assert_eq!(
            url_host("https://www.e-manuscripta.ch/zuz/content/zoom/1").as_deref(),
            Some("e-manuscripta.ch")
        );
        assert_eq!(
            url_origin("https://tecabml.contentdm.oclc.org/digital/collection/plutei/id/9")
                .as_deref(),
            Some("https://tecabml.contentdm.oclc.org")
        );
        assert!(url_host("not a url").is_none());
    }

    #[test]
    fn test_absolutize_url_variants() {
        let base = Url::parse("https://example.com/foo/").unwrap();
        assert_eq!(
            absolutize_url("https://other.com/path", &base).as_deref(),
            Some("https://other.com/path")
        );
        assert_eq!(
            absolutize_url("//example.com/bar", &base).as_deref(),
            Some("https://example.com/bar")
        );
        assert_eq!(
            absolutize_url("bar", &base).as_deref(),
            Some("https://example.com/foo/bar")
        );
    }

    // ==================== HTML Tests ====================

    #[test]
    fn test_html_title_decodes_entities() {
        let html = "<html><head><title>\n  Codex &amp; Glossen &#8211; Z&#xFC;rich\n</title></head>";
        assert_eq!(html_title(html).unwrap(), "Codex & Glossen \u{2013} Zürich");
    }

    #[test]
    fn test_html_title_missing_or_empty() {
        assert!(html_title("<html></html>").is_none());
        assert!(html_title("<title>   </title>").is_none());
    }

    #[test]
    fn test_decode_html_entities_leaves_unknown_alone() {
        assert_eq!(decode_html_entities("a &bogus; b & c"), "a &bogus; b & c");
    }
}
