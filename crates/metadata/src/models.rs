//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Media object record tracking one stored file's lifecycle.
///
/// Created as `staging` when the upload lands; confirmed by the owning
/// submission's collaborator; aged to `orphaned` by the scanner; removed
/// when cleanup deletes the object.
#[derive(Debug, Clone, FromRow)]
pub struct MediaObjectRow {
    pub media_id: Uuid,
    pub filename: String,
    /// Storage prefix the object lives under. Legacy rows may lack it and
    /// are matched through `access_url` or the bare filename instead.
    pub storage_prefix: Option<String>,
    pub storage_key: String,
    /// Public URL of the object, when the upload surface issued one.
    pub access_url: Option<String>,
    pub upload_status: String,
    pub size_bytes: i64,
    /// Back-reference to the owning submission, when one exists.
    pub submission_id: Option<Uuid>,
    /// Denormalized state of the owning submission, maintained by the
    /// external collaborator that finalizes submissions.
    pub submission_state: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

/// Cleanup job record: audit trail for every scan/cleanup invocation.
///
/// Configuration, metrics, itemized results, and logs are persisted as JSON
/// text columns; the typed forms live in `repos::cleanup_jobs`.
#[derive(Debug, Clone, FromRow)]
pub struct CleanupJobRow {
    pub cleanup_job_id: Uuid,
    pub job_type: String,
    pub status: String,
    pub config_json: String,
    pub metrics_json: Option<String>,
    pub orphaned_files_json: Option<String>,
    pub execution_log_json: Option<String>,
    pub error_log_json: Option<String>,
    /// How the job was started: manual, scheduled, or api.
    pub triggered_by: String,
    /// Identity that started the job, for triage.
    pub executed_by: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}
