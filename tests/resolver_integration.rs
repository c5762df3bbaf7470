//! Integration tests for manifest resolution over real HTTP.
//!
//! Runs the default adapter registry against a local wiremock server through
//! the production [`HttpFetcher`].

use std::sync::Arc;
use std::time::Duration;

use manuscript_core::{
    HttpFetcher, ImageLocator, ManifestResolver, RateLimiter, ResolveContext, ResolveError,
    RetryPolicy, build_default_registry,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::fixtures::iiif_v2;
use support::socket_guard::start_mock_server_or_skip;

#[allow(clippy::unwrap_used)]
fn resolver() -> ManifestResolver {
    let fetcher = HttpFetcher::new(Arc::new(RateLimiter::disabled())).unwrap();
    let retry = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50), 2.0);
    let ctx = ResolveContext::new(Arc::new(fetcher)).with_retry_policy(retry);
    ManifestResolver::new(Arc::new(build_default_registry()), ctx)
}

fn direct_urls(pages: &[manuscript_core::Page]) -> Vec<String> {
    pages
        .iter()
        .map(|page| match &page.locator {
            ImageLocator::Direct { url } => url.clone(),
            ImageLocator::Tiled(tiles) => tiles.url_template.clone(),
        })
        .collect()
}

async fn mount_json(server: &MockServer, at: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

// ==================== IIIF Tests ====================

#[tokio::test]
async fn test_resolves_iiif_v2_manifest() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let base = server.uri();
    mount_json(
        &server,
        "/codex/manifest.json",
        iiif_v2("Codex Sangallensis 390", 3, |i| format!("{base}/img/{i}.jpg")),
    )
    .await;

    let manifest = resolver()
        .resolve(&format!("{base}/codex/manifest.json"))
        .await
        .unwrap();

    assert_eq!(manifest.title(), "Codex Sangallensis 390");
    assert_eq!(manifest.source().adapter_id, "iiif");
    assert_eq!(manifest.len(), 3);
    let indices: Vec<u32> = manifest.pages().iter().map(|page| page.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert_eq!(manifest.pages()[1].label, "f. 2");
    assert_eq!(
        direct_urls(manifest.pages()),
        vec![
            format!("{base}/img/1.jpg"),
            format!("{base}/img/2.jpg"),
            format!("{base}/img/3.jpg"),
        ]
    );
}

#[tokio::test]
async fn test_resolves_iiif_v3_manifest_through_image_service() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let base = server.uri();
    let canvas = |i: u32| {
        json!({
            "id": format!("{base}/canvas/{i}"),
            "type": "Canvas",
            "label": {"none": [format!("Folio {i}")]},
            "items": [{"items": [{"body": {
                "id": format!("{base}/img/{i}/full/600,/0/default.jpg"),
                "service": [{"id": format!("{base}/iiif/3/{i}"), "type": "ImageService3"}]
            }}]}]
        })
    };
    mount_json(
        &server,
        "/books/ms-12/manifest",
        json!({
            "@context": "http://iiif.io/api/presentation/3/context.json",
            "type": "Manifest",
            "label": {"en": ["Book of Hours"]},
            "items": [canvas(1), canvas(2)]
        }),
    )
    .await;

    let manifest = resolver()
        .resolve(&format!("{base}/books/ms-12/manifest"))
        .await
        .unwrap();

    assert_eq!(manifest.title(), "Book of Hours");
    assert_eq!(manifest.pages()[0].label, "Folio 1");
    assert_eq!(
        direct_urls(manifest.pages()),
        vec![
            format!("{base}/iiif/3/1/full/max/0/default.jpg"),
            format!("{base}/iiif/3/2/full/max/0/default.jpg"),
        ]
    );
}

// ==================== ContentDM Tests ====================

#[tokio::test]
async fn test_resolves_contentdm_compound_object() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let base = server.uri();
    let state = json!({
        "item": {
            "item": {"id": 200, "parentId": -1, "title": "Plut. 39.1"},
            "children": [
                {"id": 201, "title": "c. 1r"},
                {"id": 202, "title": "Color chart"},
                {"id": 203, "title": "c. 1v"}
            ]
        }
    });
    let escaped = state.to_string().replace('\\', "\\\\").replace('"', "\\\"");
    let html = format!(
        "<html><head><script>window.__INITIAL_STATE__ = JSON.parse(\"{escaped}\");</script></head></html>"
    );
    Mock::given(method("GET"))
        .and(path("/digital/collection/plutei/id/200"))
        .respond_with(ResponseTemplate::new(200).set_body_string(html))
        .mount(&server)
        .await;

    let manifest = resolver()
        .resolve(&format!("{base}/digital/collection/plutei/id/200"))
        .await
        .unwrap();

    assert_eq!(manifest.source().adapter_id, "contentdm");
    assert_eq!(manifest.title(), "Plut. 39.1");
    let labels: Vec<&str> = manifest.pages().iter().map(|page| page.label.as_str()).collect();
    assert_eq!(labels, vec!["c. 1r", "c. 1v"]);
    assert_eq!(
        direct_urls(manifest.pages()),
        vec![
            format!("{base}/iiif/2/plutei:201/full/max/0/default.jpg"),
            format!("{base}/iiif/2/plutei:203/full/max/0/default.jpg"),
        ]
    );
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_transient_manifest_failure_is_retried() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/flaky/manifest.json"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_json(
        &server,
        "/flaky/manifest.json",
        iiif_v2("Recovered", 1, |i| format!("{base}/img/{i}.jpg")),
    )
    .await;

    let manifest = resolver()
        .resolve(&format!("{base}/flaky/manifest.json"))
        .await
        .unwrap();
    assert_eq!(manifest.title(), "Recovered");
}

#[tokio::test]
async fn test_missing_manifest_is_permanent_format_error() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/gone/manifest.json"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let error = resolver()
        .resolve(&format!("{}/gone/manifest.json", server.uri()))
        .await
        .unwrap_err();
    assert!(
        matches!(error, ResolveError::PermanentFormat { .. }),
        "expected PermanentFormat, got {error:?}"
    );
    assert!(!error.is_transient());
}

#[tokio::test]
async fn test_non_manifest_json_is_rejected() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_json(&server, "/odd/manifest.json", json!({"hello": "world"})).await;

    let error = resolver()
        .resolve(&format!("{}/odd/manifest.json", server.uri()))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("IIIF"), "got: {error}");
}

#[tokio::test]
async fn test_unsupported_url_fetches_nothing() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let error = resolver()
        .resolve(&format!("{}/blog/post.html", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(error, ResolveError::UnsupportedSource { .. }));
}

// ==================== Cache Tests ====================

#[tokio::test]
async fn test_concurrent_resolutions_share_one_request() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/shared/manifest.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(iiif_v2("Shared", 2, |i| format!("{base}/img/{i}.jpg")))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let resolver = Arc::new(resolver());
    let url = format!("{base}/shared/manifest.json");
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let resolver = Arc::clone(&resolver);
            let url = url.clone();
            tokio::spawn(async move { resolver.resolve(&url).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 2);
    }

    // Served from cache now.
    let again = resolver.resolve(&url).await.unwrap();
    assert_eq!(again.title(), "Shared");
    assert_eq!(resolver.cached_len(), 1);
}
