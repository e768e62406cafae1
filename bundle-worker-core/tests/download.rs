mod common;

use std::fs;
use std::sync::Arc;

use bundle_worker_core::contract::{MockCredentialStore, SourceCoordinates};
use bundle_worker_core::download::{
    extract, extract_blocking, resolve_working_dir, FetchError, SourceFetcher,
};
use bundle_worker_core::error::{JobError, StoreError};
use common::zipball;
use mockito::Matcher;
use tempfile::tempdir;

fn source(reference: &str, commit: &str) -> SourceCoordinates {
    SourceCoordinates {
        owner: "acme".into(),
        repo: "ui".into(),
        path: String::new(),
        reference: reference.into(),
        commit: commit.into(),
    }
}

fn credentials_returning(token: Option<&'static str>) -> Arc<MockCredentialStore> {
    let mut credentials = MockCredentialStore::new();
    credentials
        .expect_access_token()
        .returning(move |_| Ok(token.map(str::to_string)));
    Arc::new(credentials)
}

#[test]
fn archive_url_prefers_commit() {
    let fetcher = SourceFetcher::new("https://api.example.com/", credentials_returning(None));
    assert_eq!(
        fetcher.archive_url(&source("develop", "abc123")),
        "https://api.example.com/repos/acme/ui/zipball/abc123"
    );
    assert_eq!(
        fetcher.archive_url(&source("", "")),
        "https://api.example.com/repos/acme/ui/zipball/main"
    );
}

#[tokio::test]
async fn download_sends_owner_token() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/repos/acme/ui/zipball/v1.2.0")
        .match_header("authorization", "Bearer ghp_secret")
        .with_status(200)
        .with_body(zipball(&[("acme-ui-abc/", ""), ("acme-ui-abc/index.html", "<html></html>")]))
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let fetcher = SourceFetcher::new(server.url(), credentials_returning(Some("ghp_secret")));
    let archive = fetcher
        .download_archive(dir.path(), &source("v1.2.0", ""), "user-1")
        .await
        .unwrap();

    mock.assert_async().await;
    assert!(archive.is_file());
    let top = extract(archive, dir.path().join("src")).await.unwrap();
    assert_eq!(top, dir.path().join("src/acme-ui-abc"));
    assert!(top.join("index.html").is_file());
}

#[tokio::test]
async fn download_without_owner_is_anonymous() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/repos/acme/ui/zipball/main")
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .with_body(zipball(&[("acme-ui-abc/index.html", "x")]))
        .create_async()
        .await;

    let mut credentials = MockCredentialStore::new();
    credentials.expect_access_token().times(0);

    let dir = tempdir().unwrap();
    SourceFetcher::new(server.url(), Arc::new(credentials))
        .download_archive(dir.path(), &source("", ""), "")
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn credential_failure_falls_back_to_anonymous() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/repos/acme/ui/zipball/main")
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .with_body(zipball(&[("acme-ui-abc/index.html", "x")]))
        .create_async()
        .await;

    let mut credentials = MockCredentialStore::new();
    credentials
        .expect_access_token()
        .returning(|_| Err(StoreError::Corrupt("bad row".into())));

    let dir = tempdir().unwrap();
    SourceFetcher::new(server.url(), Arc::new(credentials))
        .download_archive(dir.path(), &source("", ""), "user-1")
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn non_success_status_carries_body() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/repos/acme/ui/zipball/main")
        .with_status(404)
        .with_body(r#"{"message":"Not Found"}"#)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let err = SourceFetcher::new(server.url(), credentials_returning(None))
        .download_archive(dir.path(), &source("", ""), "user-1")
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Status { .. }), "{err}");
    let msg = err.to_string();
    assert!(msg.starts_with("zip download failed: 404"), "{msg}");
    assert!(msg.contains("Not Found"), "{msg}");
}

#[test]
fn extraction_rejects_garbage_and_empty_archives() {
    let dir = tempdir().unwrap();
    let garbage = dir.path().join("garbage.zip");
    fs::write(&garbage, b"not a zip").unwrap();
    assert!(matches!(
        extract_blocking(&garbage, &dir.path().join("out")),
        Err(FetchError::Zip(_))
    ));

    let empty = dir.path().join("empty.zip");
    fs::write(&empty, zipball(&[])).unwrap();
    assert!(matches!(
        extract_blocking(&empty, &dir.path().join("out")),
        Err(FetchError::EmptyArchive)
    ));
}

#[test]
fn working_dir_must_exist_inside_the_archive() {
    let dir = tempdir().unwrap();
    let top = dir.path().join("acme-ui-abc");
    fs::create_dir_all(top.join("packages/button")).unwrap();

    assert_eq!(resolve_working_dir(&top, "").unwrap(), top);
    assert_eq!(resolve_working_dir(&top, "/").unwrap(), top);
    assert_eq!(
        resolve_working_dir(&top, "/packages/button/").unwrap(),
        top.join("packages/button")
    );

    for bad in ["nope", "../acme-ui-abc", "packages/../.."] {
        let err = resolve_working_dir(&top, bad).unwrap_err();
        assert!(matches!(err, JobError::InvalidPath(_)), "{bad}: {err}");
        assert!(err.to_string().starts_with("invalid path in repo"), "{err}");
    }
}
