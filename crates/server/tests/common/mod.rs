//! Shared test fixtures.

#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use depot_core::config::{AppConfig, MetadataConfig, StorageConfig};
use depot_server::{AppState, CleanupTaskRegistry, create_router};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceExt;

/// Raw admin token matching `AdminConfig::for_testing()`'s hash.
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// In-process test server over a filesystem backend and SQLite store.
pub struct TestServer {
    pub router: Router,
    pub state: AppState,
    /// Root of the filesystem storage backend, for direct object fixtures.
    pub storage_root: PathBuf,
    _temp: tempfile::TempDir,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::for_testing()).await
    }

    pub async fn with_config(mut config: AppConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage_root = temp.path().join("storage");
        config.storage = StorageConfig::Filesystem {
            path: storage_root.clone(),
        };
        config.metadata = MetadataConfig::Sqlite {
            path: temp.path().join("metadata.db"),
        };

        let storage = depot_storage::from_config(&config.storage)
            .await
            .expect("storage backend");
        let metadata = depot_metadata::from_config(&config.metadata)
            .await
            .expect("metadata store");
        let cleanup_tasks = Arc::new(CleanupTaskRegistry::new(metadata.clone()));

        depot_server::metrics::register_metrics();

        let state = AppState::new(config, storage, metadata, cleanup_tasks);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            storage_root,
            _temp: temp,
        }
    }

    pub fn metadata(&self) -> &Arc<dyn depot_metadata::MetadataStore> {
        &self.state.metadata
    }

    pub fn storage(&self) -> &Arc<dyn depot_storage::ObjectStore> {
        &self.state.storage
    }

    /// Rewind a stored object's modification time by `days`.
    pub fn age_object(&self, key: &str, days: u64) {
        let path = self.storage_root.join(key);
        let mtime = std::time::SystemTime::now()
            - std::time::Duration::from_secs(days * 24 * 60 * 60);
        let file = std::fs::File::options()
            .write(true)
            .open(&path)
            .expect("open stored object");
        file.set_times(std::fs::FileTimes::new().set_modified(mtime))
            .expect("set mtime");
    }
}

/// Helper to make JSON requests.
pub async fn json_request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    let request_body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let request = builder.body(request_body).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

/// Poll a cleanup job until it reaches a terminal status.
pub async fn wait_for_job(server: &TestServer, job_id: &str) -> Value {
    for _ in 0..100 {
        let (status, job) = json_request(
            &server.router,
            "GET",
            &format!("/v1/admin/cleanup/jobs/{job_id}"),
            None,
            Some(ADMIN_TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let job_status = job.get("status").and_then(Value::as_str).unwrap_or("");
        if matches!(job_status, "completed" | "partial" | "failed" | "cancelled") {
            return job;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("cleanup job {job_id} never reached a terminal status");
}
