//! Integration tests for the upload surface.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestServer;
use depot_core::config::AppConfig;
use depot_metadata::repos::MediaRepo;
use depot_storage::ObjectStore;
use serde_json::Value;
use tower::ServiceExt;

const BOUNDARY: &str = "----depot-test-boundary";

/// Build a multipart/form-data body from (filename, content) pairs.
fn multipart_body(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (filename, content) in files {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn upload(server: &TestServer, files: &[(&str, &[u8])]) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/media")
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(files)))
        .unwrap();

    let response = server.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_upload_two_files_succeeds() {
    let server = TestServer::new().await;

    let (status, body) = upload(
        &server,
        &[
            ("report.pdf", b"pdf bytes".as_slice()),
            ("photo.jpg", b"jpg bytes!".as_slice()),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let uploaded = body["uploaded"].as_array().unwrap();
    assert_eq!(uploaded.len(), 2);
    assert_eq!(body["failed"].as_array().unwrap().len(), 0);

    for file in uploaded {
        assert_eq!(file["attempts"], 1);
        let key = file["storage_key"].as_str().unwrap();
        assert!(key.starts_with("media/"));

        // Bytes landed in storage, and a staging metadata row exists.
        assert!(server.storage().exists(key).await.unwrap());
        let row = server
            .metadata()
            .get_media_object_by_key(key)
            .await
            .unwrap()
            .expect("metadata row for uploaded file");
        assert_eq!(row.upload_status, "staging");
        assert!(row.storage_prefix.is_some());
    }

    assert_eq!(server.metadata().count_media_objects().await.unwrap(), 2);
}

#[tokio::test]
async fn test_upload_reports_per_file_outcomes_on_partial_failure() {
    let server = TestServer::new().await;

    let (status, body) = upload(
        &server,
        &[
            ("good.txt", b"fine".as_slice()),
            ("../evil.txt", b"nope".as_slice()),
        ],
    )
    .await;

    // Partial failure is a structured response, not an error status.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["uploaded"].as_array().unwrap().len(), 1);

    let failed = body["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["name"], "../evil.txt");
    assert_eq!(failed[0]["retryable"], false);
    assert_eq!(failed[0]["attempts"], 1);

    assert_eq!(server.metadata().count_media_objects().await.unwrap(), 1);
}

#[tokio::test]
async fn test_upload_rejects_empty_request() {
    let server = TestServer::new().await;
    let (status, body) = upload(&server, &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_upload_enforces_per_file_size_limit() {
    let mut config = AppConfig::for_testing();
    config.upload.max_file_size_bytes = 8;
    let server = TestServer::with_config(config).await;

    let (status, body) = upload(
        &server,
        &[
            ("small.txt", b"tiny".as_slice()),
            ("large.txt", b"way too many bytes".as_slice()),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["uploaded"].as_array().unwrap().len(), 1);

    let failed = body["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["name"], "large.txt");
    assert_eq!(failed[0]["retryable"], false);
    assert!(
        failed[0]["message"]
            .as_str()
            .unwrap()
            .contains("exceeds the limit")
    );
}

#[tokio::test]
async fn test_upload_enforces_file_count_limit() {
    let mut config = AppConfig::for_testing();
    config.upload.max_files_per_request = 2;
    let server = TestServer::with_config(config).await;

    let (status, body) = upload(
        &server,
        &[
            ("a.txt", b"a".as_slice()),
            ("b.txt", b"b".as_slice()),
            ("c.txt", b"c".as_slice()),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
    // The whole request is rejected: nothing was stored.
    assert_eq!(server.metadata().count_media_objects().await.unwrap(), 0);
}

#[tokio::test]
async fn test_uploaded_files_survive_subsequent_scan() {
    // An upload followed by an immediate scan must never flag the fresh
    // objects: they are tracked and inside the retention window.
    let server = TestServer::new().await;

    let (status, _) = upload(&server, &[("fresh.bin", b"fresh".as_slice())]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = common::json_request(
        &server.router,
        "POST",
        "/v1/admin/cleanup/scan",
        None,
        Some(common::ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metrics"]["orphans_found"], 0);
    assert_eq!(body["metrics"]["files_scanned"], 1);
}
