//! End-to-end CLI tests for the manuscript-downloader binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use manuscript_core::manifest::Source;
use manuscript_core::{Database, ItemOptions, ItemState, QueueStore};
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::fixtures::{iiif_v2, jpeg, pdf_page_count};
use support::socket_guard::start_mock_server_or_skip;

/// Binary isolated from the user's config, data directory and queue.
#[allow(clippy::unwrap_used)]
fn cli(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("manuscript-downloader").unwrap();
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_DATA_HOME", home.join("data"))
        .env_remove("RUST_LOG")
        .arg("--no-config")
        .arg("--db")
        .arg(home.join("queue.db"))
        .arg("-o")
        .arg(home.join("out"));
    cmd
}

#[allow(clippy::unwrap_used)]
fn home() -> TempDir {
    tempfile::tempdir().unwrap()
}

// ==================== Basic Invocation Tests ====================

#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("manuscript-downloader").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Download digitized manuscripts"))
        .stdout(predicate::str::contains("add"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("manuscript-downloader").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("manuscript-downloader"));
}

#[test]
fn test_binary_without_subcommand_fails() {
    let mut cmd = Command::cargo_bin("manuscript-downloader").unwrap();
    cmd.assert().failure();
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    let dir = home();
    cli(dir.path())
        .args(["list", "--invalid-flag"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

// ==================== Queue Management Tests ====================

#[test]
fn test_list_on_empty_queue() {
    let dir = home();
    cli(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue is empty"));
    assert!(dir.path().join("queue.db").is_file());
}

#[test]
fn test_add_unsupported_url_is_skipped() {
    let dir = home();
    cli(dir.path())
        .args(["add", "https://example.com/blog/post.html"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Skipped"));

    cli(dir.path())
        .args(["list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_add_mixed_urls_is_partial() {
    let dir = home();
    cli(dir.path())
        .args([
            "add",
            "https://iiif.test/codex/manifest.json",
            "https://example.com/nothing-here",
        ])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Queued #1 [iiif]"))
        .stderr(predicate::str::contains("Skipped https://example.com/nothing-here"));
}

#[test]
fn test_add_list_edit_remove_cycle() {
    let dir = home();
    cli(dir.path())
        .args([
            "add",
            "https://iiif.test/codex/manifest.json",
            "--pages",
            "3-7",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued #1 [iiif] https://iiif.test/codex/manifest.json"));

    cli(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("pending"))
        .stdout(predicate::str::contains("https://iiif.test/codex/manifest.json"));

    cli(dir.path())
        .args(["edit", "1", "--all-pages", "--concurrency", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated #1"));

    cli(dir.path())
        .args(["list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"page_range\": null"))
        .stdout(predicate::str::contains("\"concurrency\": 2"));

    cli(dir.path())
        .args(["remove", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed #1"));

    cli(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue is empty"));
}

#[test]
fn test_edit_without_changes_fails() {
    let dir = home();
    cli(dir.path())
        .args(["add", "https://iiif.test/codex/manifest.json"])
        .assert()
        .success();
    cli(dir.path())
        .args(["edit", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Nothing to change"));
}

#[test]
fn test_retry_requires_failed_item() {
    let dir = home();
    cli(dir.path())
        .args(["add", "https://iiif.test/codex/manifest.json"])
        .assert()
        .success();
    cli(dir.path())
        .args(["retry", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to retry item #1"));
}

/// Writes a `Failed` item straight into the queue database.
fn seed_failed_item(db_path: &Path, url: &str) -> i64 {
    tokio_test::block_on(async {
        let db = Database::new(db_path).await.unwrap();
        let store = QueueStore::open(db.clone()).await.unwrap();
        let id = store
            .insert(Source::new(url, "iiif"), ItemOptions::default())
            .await
            .unwrap()
            .id;
        store
            .update(id, |item| {
                item.state = ItemState::Failed;
                item.last_error = Some("manifest returned HTTP 500".to_string());
            })
            .await
            .unwrap();
        drop(store);
        db.close().await;
        id
    })
}

#[test]
fn test_retry_requeues_failed_item() {
    let dir = home();
    let id = seed_failed_item(
        &dir.path().join("queue.db"),
        "https://iiif.test/broken/manifest.json",
    );

    cli(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("failed"))
        .stdout(predicate::str::contains("error: manifest returned HTTP 500"));

    cli(dir.path())
        .args(["retry", &id.to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Re-queued #{id}")));

    cli(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("pending"));
}

#[test]
fn test_remove_unknown_item_fails() {
    let dir = home();
    cli(dir.path())
        .args(["remove", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("#42"));
}

#[test]
fn test_run_on_empty_queue_succeeds() {
    let dir = home();
    cli(dir.path()).args(["-q", "run"]).assert().success();
}

// ==================== Download Tests ====================

#[tokio::test(flavor = "multi_thread")]
async fn test_add_then_run_writes_pdf() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/codex/manifest.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(iiif_v2("Codex Test", 2, |i| format!("{base}/img/{i}.jpg"))),
        )
        .mount(&server)
        .await;
    for i in 1..=2 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{i}.jpg")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg(40, 60, 200)))
            .mount(&server)
            .await;
    }

    let dir = home();
    let manifest_url = format!("{base}/codex/manifest.json");
    let home_path = dir.path().to_path_buf();
    let output = tokio::task::spawn_blocking(move || {
        cli(&home_path).args(["add", &manifest_url]).assert().success();
        cli(&home_path)
            .args(["-l", "0", "-q", "run"])
            .assert()
            .success();
        cli(&home_path).arg("list").assert().success().get_output().clone()
    })
    .await
    .unwrap();

    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.contains("completed"), "listing: {listing}");
    let pdf: PathBuf = dir.path().join("out").join("Codex_Test.pdf");
    let bytes = std::fs::read(&pdf).unwrap();
    assert_eq!(pdf_page_count(&bytes), 2);
}
