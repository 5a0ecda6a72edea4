use std::io::Cursor;

use assert_cmd::Command;
use httpmock::prelude::*;
use image::{ImageFormat, Rgba, RgbaImage};
use predicates::prelude::*;

fn assetfetch() -> Command {
    let mut cmd = Command::cargo_bin("assetfetch").expect("binary");
    cmd.env_remove("ASSETFETCH_ORIGIN").env("RUST_LOG", "warn");
    cmd
}

fn png() -> Vec<u8> {
    let img = RgbaImage::from_pixel(8, 4, Rgba([200, 100, 50, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("encode");
    out.into_inner()
}

#[test]
fn key_prints_canonical_destinations() {
    assetfetch()
        .args(["key", "HTTPS://User@Cdn.Example.com:443/a.png", "http://h:8080/x", "nohost"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cdn.example.com\n"))
        .stdout(predicate::str::contains("http://h:8080/x\th:8080"));
}

#[test]
fn config_schema_lists_fields() {
    assetfetch()
        .args(["config", "schema"])
        .assert()
        .success()
        .stdout(predicate::str::contains("concurrency_per_destination"));
}

#[test]
fn config_show_applies_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fetch.toml");
    std::fs::write(&path, "http_max_requests = 3\n").expect("write");
    assetfetch()
        .args(["config", "show", "--format", "json", "--path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"http_max_requests\": 3"));
}

#[test]
fn fetches_and_caches_from_origin() {
    let server = MockServer::start();
    let id = "6e2c4a4e-0f3b-4b5e-9a47-6f5cf1f1a001";
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/")
            .query_param("texture_id", id)
            .header_exists("range");
        then.status(200).body(png());
    });
    let cache = tempfile::tempdir().expect("tempdir");
    let out = tempfile::tempdir().expect("tempdir");

    assetfetch()
        .args(["fetch", id, "--wait-secs", "10", "--origin"])
        .arg(server.base_url())
        .arg("--cache-dir")
        .arg(cache.path())
        .arg("--out")
        .arg(out.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{id}\tready\t8x4x4")));
    mock.assert();
    assert!(cache.path().join(format!("{id}.asset")).exists());
    assert!(out.path().join(format!("{id}.png")).exists());

    // Second run is served from the cache.
    assetfetch()
        .args(["fetch", id, "--wait-secs", "10", "--origin"])
        .arg(server.base_url())
        .arg("--cache-dir")
        .arg(cache.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("ready"));
    mock.assert_hits(1);
}

#[test]
fn missing_asset_fails() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.path("/");
        then.status(404);
    });
    let cache = tempfile::tempdir().expect("tempdir");
    assetfetch()
        .args(["fetch", "6e2c4a4e-0f3b-4b5e-9a47-6f5cf1f1a002", "--wait-secs", "10", "--origin"])
        .arg(server.base_url())
        .arg("--cache-dir")
        .arg(cache.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("failed"));
}
