//! Upload surface.
//!
//! Accepts a multipart file set, drives it through the batch upload
//! processor, and returns structured per-file outcomes. Partial failure is
//! reported in the response body, never as an error status.

use crate::error::{ApiError, ApiResult};
use crate::metrics::PrometheusSink;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Multipart, State};
use depot_core::batch::{
    BatchUploadError, BatchUploadProcessor, UploadFile, UploadReceipt, UploadedFile,
};
use depot_core::classify::UploadError;
use depot_core::media::{MediaId, UploadStatus};
use depot_metadata::MetadataStore;
use depot_metadata::models::MediaObjectRow;
use depot_metadata::repos::MediaRepo;
use depot_storage::{ObjectStore, StorageError};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;

/// Maximum filename length accepted from clients.
const MAX_FILENAME_LEN: usize = 255;

/// Upload response: per-file outcomes for the whole set.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// True iff every file was stored.
    pub success: bool,
    pub uploaded: Vec<UploadedFile>,
    pub failed: Vec<BatchUploadError>,
}

/// Validate a client-supplied filename for storage use.
fn sanitize_filename(name: &str) -> Result<String, UploadError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(UploadError::Validation("empty filename".to_string()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(UploadError::Validation(format!(
            "filename exceeds {MAX_FILENAME_LEN} characters"
        )));
    }
    if name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.chars().any(char::is_control)
    {
        return Err(UploadError::Validation(format!(
            "unsafe filename: {name:?}"
        )));
    }
    Ok(name.to_string())
}

/// Map storage failures onto the upload error taxonomy.
fn classify_storage_error(err: StorageError) -> UploadError {
    match err {
        StorageError::InvalidKey(message) => UploadError::Validation(message),
        StorageError::Io(e) => UploadError::Network(e.to_string()),
        StorageError::S3(e) => UploadError::Server(e.to_string()),
        other => UploadError::Server(other.to_string()),
    }
}

/// Store one file: stream bytes to storage, then persist a staging
/// metadata row. Called once per upload attempt.
async fn store_file(
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    max_file_size_bytes: u64,
    file: UploadFile,
) -> Result<UploadReceipt, UploadError> {
    let filename = sanitize_filename(&file.name)?;
    if file.size_bytes > max_file_size_bytes {
        return Err(UploadError::Validation(format!(
            "file of {} bytes exceeds the limit of {} bytes",
            file.size_bytes, max_file_size_bytes
        )));
    }

    let media_id = MediaId::new();
    let storage_prefix = format!("media/{media_id}");
    let storage_key = format!("{storage_prefix}/{filename}");

    storage
        .put(&storage_key, file.content.clone())
        .await
        .map_err(classify_storage_error)?;

    let now = OffsetDateTime::now_utc();
    let row = MediaObjectRow {
        media_id: *media_id.as_uuid(),
        filename,
        storage_prefix: Some(storage_prefix),
        storage_key: storage_key.clone(),
        access_url: None,
        upload_status: UploadStatus::Staging.as_str().to_string(),
        size_bytes: file.size_bytes as i64,
        submission_id: None,
        submission_state: None,
        created_at: now,
        updated_at: now,
        expires_at: None,
    };
    metadata
        .create_media_object(&row)
        .await
        .map_err(|e| UploadError::Server(format!("failed to record media object: {e}")))?;

    crate::metrics::UPLOAD_BYTES.inc_by(file.size_bytes);

    Ok(UploadReceipt {
        media_id,
        storage_key,
        url: None,
    })
}

/// POST /v1/media - Batch file upload.
pub async fn upload_media(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let max_files = state.config.upload.max_files_per_request;

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        // Only file fields carry uploads; other form fields are ignored.
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read file field: {e}")))?;

        if files.len() >= max_files {
            return Err(ApiError::BadRequest(format!(
                "more than {max_files} files in one request"
            )));
        }
        files.push(UploadFile::new(files.len(), name, data));
    }

    if files.is_empty() {
        return Err(ApiError::BadRequest("no files provided".to_string()));
    }

    let file_count = files.len();
    let processor = BatchUploadProcessor::new(state.config.upload.batch_options())
        .with_metrics(Arc::new(PrometheusSink));

    let storage = state.storage.clone();
    let metadata = state.metadata.clone();
    let max_file_size_bytes = state.config.upload.max_file_size_bytes;
    let upload = move |file: UploadFile| {
        let storage = storage.clone();
        let metadata = metadata.clone();
        async move { store_file(storage, metadata, max_file_size_bytes, file).await }
    };

    let result = processor
        .run(files, upload)
        .await
        .map_err(|e| ApiError::Internal(format!("upload run aborted: {e}")))?;

    tracing::info!(
        files = file_count,
        succeeded = result.successful.len(),
        failed = result.failed.len(),
        "upload batch finished"
    );

    Ok(Json(UploadResponse {
        success: result.success,
        uploaded: result.successful,
        failed: result.failed,
    }))
}
