//! Cleanup job API: scan, execute, cancel, and triage endpoints.
//!
//! All endpoints require the admin token. A scan is always a dry-run; only
//! the execute endpoint issues delete calls, and only against an explicit,
//! validated key list.

use crate::auth::require_admin;
use crate::cleanup::{
    CleanupExecutor, OrphanCandidate, OrphanScanner, ScanMetrics, run_cleanup_job,
    validate_scan_prefixes,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use depot_metadata::models::CleanupJobRow;
use depot_metadata::repos::CleanupJobRepo;
use depot_metadata::repos::cleanup_jobs::{
    CleanupJobConfig, CleanupJobStatus, CleanupJobType, CleanupMetrics, OrphanFileStatus,
    OrphanedFileEntry, TriggerSource,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Maximum request body size for cleanup endpoints (1 MiB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

async fn read_json_body<T: serde::de::DeserializeOwned + Default>(
    req: Request,
) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    if bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

/// Scan request. Every field falls back to the server's cleanup defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub include_directories: Vec<String>,
    pub exclude_patterns: Option<Vec<String>>,
    pub max_files_to_process: Option<u64>,
    pub retention_days: Option<u32>,
}

/// Scan response: job id plus candidates and metrics.
#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub job_id: String,
    pub candidates: Vec<OrphanCandidate>,
    pub metrics: ScanMetrics,
}

fn new_job_row(
    job_id: Uuid,
    job_type: CleanupJobType,
    config: &CleanupJobConfig,
    executed_by: &str,
) -> ApiResult<CleanupJobRow> {
    let config_json = serde_json::to_string(config)
        .map_err(|e| ApiError::Internal(format!("failed to serialize job config: {e}")))?;
    let now = OffsetDateTime::now_utc();
    Ok(CleanupJobRow {
        cleanup_job_id: job_id,
        job_type: job_type.as_str().to_string(),
        status: CleanupJobStatus::Running.as_str().to_string(),
        config_json,
        metrics_json: None,
        orphaned_files_json: None,
        execution_log_json: None,
        error_log_json: None,
        triggered_by: TriggerSource::Api.as_str().to_string(),
        executed_by: Some(executed_by.to_string()),
        started_at: Some(now),
        finished_at: None,
        created_at: now,
    })
}

fn map_create_error(err: depot_metadata::MetadataError, job_type: &str) -> ApiError {
    if matches!(err, depot_metadata::MetadataError::Constraint(_)) {
        ApiError::Conflict(format!(
            "another {job_type} job is already active; wait for it to finish"
        ))
    } else {
        err.into()
    }
}

/// POST /v1/admin/cleanup/scan - Scan for orphan candidates.
///
/// Always a dry-run: no delete call is ever issued from this endpoint.
pub async fn scan_cleanup(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<ScanResponse>> {
    let admin = require_admin(&req)?.clone();
    let body: ScanRequest = read_json_body(req).await?;

    let defaults = &state.config.cleanup;
    let include_directories =
        validate_scan_prefixes(&body.include_directories, &defaults.allowed_prefixes)?;
    let retention_days = body.retention_days.unwrap_or(defaults.retention_days);
    if retention_days == 0 {
        return Err(ApiError::BadRequest(
            "retention_days of 0 would reclaim in-flight uploads".to_string(),
        ));
    }

    let config = CleanupJobConfig {
        dry_run: true,
        include_directories,
        exclude_patterns: body
            .exclude_patterns
            .unwrap_or_else(|| defaults.exclude_patterns.clone()),
        max_files_to_process: body
            .max_files_to_process
            .unwrap_or(defaults.max_files_to_process)
            .min(defaults.max_files_to_process),
        retention_days,
    };

    let job_id = Uuid::new_v4();
    let job = new_job_row(job_id, CleanupJobType::Verification, &config, &admin.identity)?;
    state
        .metadata
        .create_cleanup_job(&job)
        .await
        .map_err(|e| map_create_error(e, CleanupJobType::Verification.as_str()))?;

    let scanner = OrphanScanner::new(state.storage.as_ref(), state.metadata.as_ref());
    match scanner.scan(&config, job_id).await {
        Ok(outcome) => {
            let metrics = CleanupMetrics {
                files_scanned: outcome.metrics.files_scanned,
                files_processed: outcome.metrics.files_scanned,
                orphaned_files_found: outcome.metrics.orphans_found,
                files_deleted: 0,
                deletion_errors: 0,
                storage_reclaimed_bytes: 0,
            };
            let items: Vec<OrphanedFileEntry> = outcome
                .candidates
                .iter()
                .map(|candidate| OrphanedFileEntry {
                    key: candidate.key.clone(),
                    size_bytes: candidate.size_bytes,
                    status: OrphanFileStatus::Found,
                    error: None,
                })
                .collect();

            state
                .metadata
                .update_cleanup_job(
                    job_id,
                    CleanupJobStatus::Completed.as_str(),
                    Some(OffsetDateTime::now_utc()),
                    serde_json::to_string(&metrics).ok().as_deref(),
                    serde_json::to_string(&items).ok().as_deref(),
                    None,
                    None,
                )
                .await?;

            Ok(Json(ScanResponse {
                job_id: job_id.to_string(),
                candidates: outcome.candidates,
                metrics: outcome.metrics,
            }))
        }
        Err(e) => {
            // Persist the failure for triage before surfacing it.
            let error_log = serde_json::json!([e.to_string()]).to_string();
            if let Err(update_err) = state
                .metadata
                .update_cleanup_job(
                    job_id,
                    CleanupJobStatus::Failed.as_str(),
                    Some(OffsetDateTime::now_utc()),
                    None,
                    None,
                    None,
                    Some(&error_log),
                )
                .await
            {
                tracing::error!(
                    job_id = %job_id,
                    error = %update_err,
                    "Failed to persist scan failure"
                );
            }
            Err(e)
        }
    }
}

/// Execute request: explicit key list, optional dry-run.
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Execute response.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub job_id: String,
}

/// POST /v1/admin/cleanup/execute - Delete a validated key list.
pub async fn execute_cleanup(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<ExecuteResponse>)> {
    let admin = require_admin(&req)?.clone();
    let body: ExecuteRequest = read_json_body(req).await?;

    // Reject malformed input before creating the job: zero destructive
    // calls may have been made when a 400 is returned.
    CleanupExecutor::validate_keys(&body.keys)?;

    let config = CleanupJobConfig {
        dry_run: body.dry_run,
        include_directories: Vec::new(),
        exclude_patterns: Vec::new(),
        max_files_to_process: body.keys.len() as u64,
        retention_days: state.config.cleanup.retention_days,
    };

    let job_id = Uuid::new_v4();
    let job = new_job_row(job_id, CleanupJobType::Cleanup, &config, &admin.identity)?;
    state
        .metadata
        .create_cleanup_job(&job)
        .await
        .map_err(|e| map_create_error(e, CleanupJobType::Cleanup.as_str()))?;

    crate::metrics::CLEANUP_JOBS_ACTIVE.inc();

    let storage = state.storage.clone();
    let metadata = state.metadata.clone();
    let batch_size = state.config.cleanup.delete_batch_size;
    let keys = body.keys;
    let dry_run = body.dry_run;

    let handle = tokio::spawn(async move {
        run_cleanup_job(job_id, keys, dry_run, storage, metadata, batch_size).await;
        crate::metrics::CLEANUP_JOBS_ACTIVE.dec();
    });
    state.cleanup_tasks.register(job_id, handle).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(ExecuteResponse {
            job_id: job_id.to_string(),
        }),
    ))
}

/// Cleanup job response for triage endpoints.
#[derive(Debug, Serialize)]
pub struct CleanupJobResponse {
    pub job_id: String,
    pub job_type: String,
    pub status: String,
    pub config: serde_json::Value,
    pub metrics: Option<serde_json::Value>,
    pub orphaned_files: Option<serde_json::Value>,
    pub execution_log: Option<serde_json::Value>,
    pub error_log: Option<serde_json::Value>,
    pub triggered_by: String,
    pub executed_by: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub created_at: String,
}

fn job_row_to_response(job: CleanupJobRow) -> CleanupJobResponse {
    let parse = |json: &str| serde_json::from_str(json).unwrap_or(serde_json::Value::Null);
    CleanupJobResponse {
        job_id: job.cleanup_job_id.to_string(),
        job_type: job.job_type,
        status: job.status,
        config: parse(&job.config_json),
        metrics: job.metrics_json.as_deref().map(parse),
        orphaned_files: job.orphaned_files_json.as_deref().map(parse),
        execution_log: job.execution_log_json.as_deref().map(parse),
        error_log: job.error_log_json.as_deref().map(parse),
        triggered_by: job.triggered_by,
        executed_by: job.executed_by,
        started_at: job.started_at.and_then(|t| t.format(&Rfc3339).ok()),
        finished_at: job.finished_at.and_then(|t| t.format(&Rfc3339).ok()),
        created_at: job
            .created_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| job.created_at.to_string()),
    }
}

fn parse_job_id(job_id: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(job_id).map_err(|e| ApiError::BadRequest(format!("invalid job id: {e}")))
}

/// POST /v1/admin/cleanup/jobs/{job_id}/cancel - Cancel a running job.
///
/// Bookkeeping only: the executor observes the new status between delete
/// batches and never aborts an already-issued storage call.
pub async fn cancel_cleanup_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    req: Request,
) -> ApiResult<Json<CleanupJobResponse>> {
    require_admin(&req)?;
    let job_id = parse_job_id(&job_id)?;

    let changed = state
        .metadata
        .update_cleanup_job_status(
            job_id,
            &[
                CleanupJobStatus::Pending.as_str(),
                CleanupJobStatus::Running.as_str(),
            ],
            CleanupJobStatus::Cancelled.as_str(),
        )
        .await?;

    let job = state
        .metadata
        .get_cleanup_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cleanup job {job_id}")))?;

    if changed == 0 {
        return Err(ApiError::Conflict(format!(
            "cleanup job is {}, cannot cancel",
            job.status
        )));
    }

    tracing::info!(job_id = %job_id, "Cleanup job cancelled");
    Ok(Json(job_row_to_response(job)))
}

/// Job listing parameters.
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub limit: Option<u32>,
}

/// Job listing response.
#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<CleanupJobResponse>,
}

/// GET /v1/admin/cleanup/jobs - List recent cleanup jobs.
pub async fn list_cleanup_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
    req: Request,
) -> ApiResult<Json<ListJobsResponse>> {
    require_admin(&req)?;

    let limit = params.limit.unwrap_or(20).min(100);
    let jobs = state.metadata.list_recent_cleanup_jobs(limit).await?;
    Ok(Json(ListJobsResponse {
        jobs: jobs.into_iter().map(job_row_to_response).collect(),
    }))
}

/// GET /v1/admin/cleanup/jobs/{job_id} - Get one cleanup job.
pub async fn get_cleanup_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    req: Request,
) -> ApiResult<Json<CleanupJobResponse>> {
    require_admin(&req)?;
    let job_id = parse_job_id(&job_id)?;

    let job = state
        .metadata
        .get_cleanup_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cleanup job {job_id}")))?;
    Ok(Json(job_row_to_response(job)))
}
