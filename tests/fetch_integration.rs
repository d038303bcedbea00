//! End-to-end tests for the fetch engine against a stubbed upstream.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use zshelf::auth::{
    Credential, CredentialAuth, CredentialError, CredentialState, CredentialStatus, ProbeOutcome,
    RotationState, RotationStateFile,
};
use zshelf::catalog::{BookFilters, CatalogService, DownloadStatus};
use zshelf::db::Database;
use zshelf::fetch::{FetchConfig, FetchEngine, FetchError};
use zshelf::upstream::{RemoteBook, SearchFilters, SessionPool, UpstreamClient, UpstreamConfig};
use zshelf::CredentialManager;

fn token_credential(id: &str) -> Credential {
    Credential::new(CredentialAuth::Token {
        user_id: id.to_string(),
        user_key: format!("key-{id}"),
    })
}

fn cookie_for(id: &str) -> String {
    format!("siteLanguageV2=en; remix_userid={id}; remix_userkey=key-{id}")
}

/// Seeds the rotation state file with per-identity entries.
fn seed_state(path: &Path, entries: &[(&str, CredentialStatus, Option<i64>)]) {
    let mut credentials_status = BTreeMap::new();
    for (identity, status, downloads_left) in entries {
        credentials_status.insert(
            (*identity).to_string(),
            CredentialState {
                last_used: None,
                downloads_left: *downloads_left,
                status: *status,
                extra: serde_json::Map::new(),
            },
        );
    }
    RotationStateFile::new(path)
        .save(&RotationState {
            current_index: 0,
            last_rotation: None,
            credentials_status,
            extra: serde_json::Map::new(),
        })
        .unwrap();
}

async fn engine_with(
    server: &MockServer,
    credentials: Vec<Credential>,
    state_path: &Path,
) -> FetchEngine {
    let manager = CredentialManager::new(credentials, RotationStateFile::new(state_path));
    let client = UpstreamClient::new(UpstreamConfig {
        base_url: server.uri().parse().unwrap(),
        timeout: Duration::from_secs(5),
    });
    let pool = SessionPool::new(client, manager);
    let db = Database::open_in_memory().await.unwrap();
    FetchEngine::new(
        pool,
        CatalogService::new(db),
        FetchConfig {
            retry_delay: Duration::from_millis(5),
        },
    )
}

async fn mount_profile_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/eapi/user/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "user": {"downloads_limit": 10, "downloads_today": 0}
        })))
        .mount(server)
        .await;
}

fn search_body(books: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "success": true,
        "books": books
    }))
}

fn extract_userid(cookie: &str) -> String {
    cookie
        .split("remix_userid=")
        .nth(1)
        .and_then(|rest| rest.split(';').next())
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[tokio::test]
async fn test_search_and_store_persists_expected_rows() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi/book/search"))
        .respond_with(search_body(serde_json::json!([
            {"id": "A", "hash": "h", "title": "T1", "author": "X, Y"},
            {"id": "B", "hash": "h2", "title": "T2", "author": "X"}
        ])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_with(
        &server,
        vec![token_credential("c1")],
        &dir.path().join("state.json"),
    )
    .await;

    let cancel = CancellationToken::new();
    let books = engine
        .search("q", &SearchFilters::default(), true, &cancel)
        .await
        .unwrap();
    assert_eq!(books.len(), 2);

    let catalog = engine.catalog();
    assert_eq!(catalog.count(&BookFilters::default()).await.unwrap(), 2);

    let (author_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM authors")
        .fetch_one(catalog.db().pool())
        .await
        .unwrap();
    assert_eq!(author_count, 2);

    let links: Vec<(String, String, i64)> = sqlx::query_as(
        r"SELECT ba.book_id, a.name, ba.author_order
          FROM book_authors ba JOIN authors a ON a.id = ba.author_id
          ORDER BY ba.book_id, ba.author_order",
    )
    .fetch_all(catalog.db().pool())
    .await
    .unwrap();
    assert_eq!(
        links,
        [
            ("A".to_string(), "X".to_string(), 0),
            ("A".to_string(), "Y".to_string(), 1),
            ("B".to_string(), "X".to_string(), 0),
        ]
    );

    let history = catalog.recent_searches(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].search_query, "q");
}

#[tokio::test]
async fn test_rotation_order_across_three_credentials_one_exhausted() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi/book/search"))
        .respond_with(search_body(serde_json::json!([])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    seed_state(
        &state_path,
        &[("c2", CredentialStatus::Exhausted, Some(0))],
    );

    let mut engine = engine_with(
        &server,
        vec![
            token_credential("c1"),
            token_credential("c2"),
            token_credential("c3"),
        ],
        &state_path,
    )
    .await;

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        engine
            .search("q", &SearchFilters::default(), false, &cancel)
            .await
            .unwrap();
    }

    // Credentials used, in order, as seen by the stub.
    let requests = server.received_requests().await.unwrap();
    let used: Vec<String> = requests
        .iter()
        .filter(|r| r.url.path() == "/eapi/book/search")
        .map(|r| {
            let cookie = r.headers.get("cookie").unwrap().to_str().unwrap();
            extract_userid(cookie)
        })
        .collect();
    assert_eq!(used, ["c1", "c3", "c1"]);

    // The cursor rests on c3 and the state file says so.
    assert_eq!(engine.pool().manager().current_index(), 2);
    let stored = RotationStateFile::new(&state_path).load();
    assert_eq!(stored.current_index, 2);
}

#[tokio::test]
async fn test_download_success_records_row_and_decrements_quota() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/eapi/book/B/h2/file"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "file": {
                "description": "T2",
                "author": "X",
                "extension": "pdf",
                "downloadLink": format!("{}/payload/B", server.uri())
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/payload/B"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PDFBYTES".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    seed_state(&state_path, &[("c1", CredentialStatus::Valid, Some(3))]);
    let mut engine = engine_with(&server, vec![token_credential("c1")], &state_path).await;

    let out_dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let book = RemoteBook {
        id: "B".to_string(),
        hash: "h2".to_string(),
        title: "T2".to_string(),
        ..RemoteBook::default()
    };

    let outcome = engine.download(&book, out_dir.path(), &cancel).await.unwrap();
    assert_eq!(outcome.filename, "T2 (X).pdf");
    assert_eq!(outcome.bytes, 8);
    assert_eq!(std::fs::read(&outcome.path).unwrap(), b"PDFBYTES");

    let records = engine.catalog().recent_downloads(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status(), DownloadStatus::Completed);
    assert_eq!(records[0].file_size, Some(8));
    assert_eq!(records[0].credential_identity.as_deref(), Some("c1"));

    // Quota decremented by exactly one.
    assert_eq!(
        engine.pool().manager().credentials()[0].downloads_left,
        Some(2)
    );
}

#[tokio::test]
async fn test_download_payload_failure_keeps_quota_and_cursor() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/eapi/book/B/h2/file"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "file": {
                "description": "T2",
                "extension": "pdf",
                "downloadLink": format!("{}/payload/B", server.uri())
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/payload/B"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    seed_state(&state_path, &[("c1", CredentialStatus::Valid, Some(5))]);
    let mut engine = engine_with(&server, vec![token_credential("c1")], &state_path).await;

    let out_dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let book = RemoteBook {
        id: "B".to_string(),
        hash: "h2".to_string(),
        title: "T2".to_string(),
        ..RemoteBook::default()
    };

    let error = engine
        .download(&book, out_dir.path(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(error, FetchError::Upstream(_)));

    // A failed row with a populated message.
    let records = engine.catalog().recent_downloads(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status(), DownloadStatus::Failed);
    assert!(records[0].error_message.as_deref().unwrap().contains("404"));

    // Quota and cursor untouched.
    assert_eq!(
        engine.pool().manager().credentials()[0].downloads_left,
        Some(5)
    );
    assert_eq!(engine.pool().manager().current_index(), 0);
}

#[tokio::test]
async fn test_download_with_all_credentials_exhausted_records_nothing() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    seed_state(
        &state_path,
        &[
            ("c1", CredentialStatus::Exhausted, Some(0)),
            ("c2", CredentialStatus::Exhausted, Some(0)),
        ],
    );
    let state_before = std::fs::read(&state_path).unwrap();

    let mut engine = engine_with(
        &server,
        vec![token_credential("c1"), token_credential("c2")],
        &state_path,
    )
    .await;

    let out_dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let book = RemoteBook {
        id: "B".to_string(),
        hash: "h2".to_string(),
        title: "T2".to_string(),
        ..RemoteBook::default()
    };

    let error = engine
        .download(&book, out_dir.path(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        FetchError::Credentials(CredentialError::AllCredentialsExhausted)
    ));

    // No download row, no upstream call, state file untouched.
    assert!(engine.catalog().recent_downloads(10).await.unwrap().is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(std::fs::read(&state_path).unwrap(), state_before);
}

#[tokio::test]
async fn test_cancel_mid_all_pages_keeps_page_one_only() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi/book/search"))
        .and(body_string_contains("page=1"))
        .respond_with(search_body(serde_json::json!([
            {"id": "P1A", "hash": "h", "title": "Page1 A"},
            {"id": "P1B", "hash": "h", "title": "Page1 B"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/eapi/book/search"))
        .and(body_string_contains("page=2"))
        .respond_with(
            search_body(serde_json::json!([{"id": "P2A", "hash": "h", "title": "Page2 A"}]))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_with(
        &server,
        vec![token_credential("c1")],
        &dir.path().join("state.json"),
    )
    .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let filters = SearchFilters {
        limit: Some(2),
        ..SearchFilters::default()
    };
    let error = engine
        .search_all_pages("q", &filters, true, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(error, FetchError::Cancelled));

    // Page 1 is in the catalog; nothing from page 2.
    let catalog = engine.catalog();
    assert_eq!(catalog.count(&BookFilters::default()).await.unwrap(), 2);
    assert!(catalog.books().get_by_id("P2A").await.unwrap().is_none());
    assert_eq!(catalog.recent_searches(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_transient_search_failures_retry_then_rotate() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi/book/search"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_with(
        &server,
        vec![token_credential("c1"), token_credential("c2")],
        &dir.path().join("state.json"),
    )
    .await;

    let cancel = CancellationToken::new();
    let error = engine
        .search("q", &SearchFilters::default(), false, &cancel)
        .await
        .unwrap_err();
    match error {
        FetchError::Upstream(upstream) => assert!(upstream.is_transient()),
        other => panic!("expected upstream error, got {other:?}"),
    }

    // Two attempts per credential: initial + one retry, times two
    // credentials.
    let searches = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/eapi/book/search")
        .count();
    assert_eq!(searches, 4);

    // Transient failures never mark credentials unusable.
    assert!(engine.pool().manager().has_available());
}

#[tokio::test]
async fn test_quota_signal_marks_exhausted_and_rotates() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi/book/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "error": "daily limit reached"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_with(
        &server,
        vec![token_credential("c1"), token_credential("c2")],
        &dir.path().join("state.json"),
    )
    .await;

    let cancel = CancellationToken::new();
    let error = engine
        .search("q", &SearchFilters::default(), false, &cancel)
        .await
        .unwrap_err();
    match error {
        FetchError::Upstream(upstream) => assert!(upstream.is_quota()),
        other => panic!("expected quota error, got {other:?}"),
    }

    for credential in engine.pool().manager().credentials() {
        assert_eq!(credential.status, CredentialStatus::Exhausted);
        assert_eq!(credential.downloads_left, Some(0));
    }
}

#[tokio::test]
async fn test_validate_all_distinguishes_valid_and_rejected() {
    let server = MockServer::start().await;
    // The rejected credential matches first on its exact cookie.
    Mock::given(method("GET"))
        .and(path("/eapi/user/profile"))
        .and(header("cookie", cookie_for("bad").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "error": "invalid user key"
        })))
        .mount(&server)
        .await;
    mount_profile_ok(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let manager = CredentialManager::new(
        vec![token_credential("good"), token_credential("bad")],
        RotationStateFile::new(dir.path().join("state.json")),
    );
    let client = UpstreamClient::new(UpstreamConfig {
        base_url: server.uri().parse().unwrap(),
        timeout: Duration::from_secs(5),
    });
    let mut pool = SessionPool::new(client, manager);

    let outcomes = pool.validate_all().await;
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(
        outcomes[0].1,
        ProbeOutcome::Valid {
            downloads_left: Some(10)
        }
    ));
    assert!(matches!(outcomes[1].1, ProbeOutcome::Rejected { .. }));

    assert_eq!(
        pool.manager().credentials()[0].status,
        CredentialStatus::Valid
    );
    assert_eq!(
        pool.manager().credentials()[1].status,
        CredentialStatus::Invalid
    );
    assert!(pool.manager().has_available());
}

#[tokio::test]
async fn test_download_all_pages_stores_and_downloads_each_result() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi/book/search"))
        .respond_with(search_body(serde_json::json!([
            {"id": "B", "hash": "h2", "title": "T2", "author": "X"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/eapi/book/B/h2/file"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "file": {
                "description": "T2",
                "extension": "pdf",
                "downloadLink": format!("{}/payload/B", server.uri())
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/payload/B"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_with(
        &server,
        vec![token_credential("c1")],
        &dir.path().join("state.json"),
    )
    .await;

    let out_dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let outcomes = engine
        .download_all_pages("q", &SearchFilters::default(), out_dir.path(), &cancel)
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].path.exists());

    let catalog = engine.catalog();
    assert!(catalog.books().get_by_id("B").await.unwrap().is_some());
    let records = catalog.recent_downloads(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status(), DownloadStatus::Completed);
    assert_eq!(catalog.recent_searches(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_download_filename_collision_gets_suffix() {
    let server = MockServer::start().await;
    mount_profile_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/eapi/book/B/h2/file"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "file": {
                "description": "Same Name",
                "extension": "pdf",
                "downloadLink": format!("{}/payload/B", server.uri())
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/payload/B"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_with(
        &server,
        vec![token_credential("c1")],
        &dir.path().join("state.json"),
    )
    .await;

    let out_dir = tempfile::tempdir().unwrap();
    std::fs::write(out_dir.path().join("Same Name.pdf"), b"existing").unwrap();

    let cancel = CancellationToken::new();
    let book = RemoteBook {
        id: "B".to_string(),
        hash: "h2".to_string(),
        title: "Same Name".to_string(),
        ..RemoteBook::default()
    };
    let outcome = engine.download(&book, out_dir.path(), &cancel).await.unwrap();

    assert_eq!(outcome.filename, "Same Name_2.pdf");
    assert_eq!(
        std::fs::read(out_dir.path().join("Same Name.pdf")).unwrap(),
        b"existing"
    );
}
