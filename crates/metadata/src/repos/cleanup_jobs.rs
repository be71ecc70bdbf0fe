//! Cleanup job repository and state machine types.

use crate::error::MetadataResult;
use crate::models::CleanupJobRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for cleanup job records.
#[async_trait]
pub trait CleanupJobRepo: Send + Sync {
    /// Create a cleanup job. Fails with a Constraint error when another job
    /// of the same type is already pending or running (single-flight guard).
    async fn create_cleanup_job(&self, job: &CleanupJobRow) -> MetadataResult<()>;

    /// Get a cleanup job by ID.
    async fn get_cleanup_job(&self, job_id: Uuid) -> MetadataResult<Option<CleanupJobRow>>;

    /// Update a finished (or progressing) job's status and result columns.
    #[allow(clippy::too_many_arguments)]
    async fn update_cleanup_job(
        &self,
        job_id: Uuid,
        status: &str,
        finished_at: Option<time::OffsetDateTime>,
        metrics_json: Option<&str>,
        orphaned_files_json: Option<&str>,
        execution_log_json: Option<&str>,
        error_log_json: Option<&str>,
    ) -> MetadataResult<()>;

    /// Update only the status of a job, guarded on its current status.
    /// Returns the number of rows changed (0 when the guard did not match).
    async fn update_cleanup_job_status(
        &self,
        job_id: Uuid,
        from_statuses: &[&str],
        to_status: &str,
    ) -> MetadataResult<u64>;

    /// Get the most recent cleanup jobs, newest first.
    async fn list_recent_cleanup_jobs(&self, limit: u32) -> MetadataResult<Vec<CleanupJobRow>>;

    /// Get jobs still pending or running. Used for duplicate detection and
    /// for recovery of jobs stranded by a crash.
    async fn get_active_cleanup_jobs(&self) -> MetadataResult<Vec<CleanupJobRow>>;
}

/// Cleanup job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupJobType {
    /// Scan storage for orphans without deleting anything.
    Verification,
    /// Delete a validated orphan key list.
    Cleanup,
    /// Reconciliation report over the audit trail.
    Audit,
}

impl CleanupJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Cleanup => "cleanup",
            Self::Audit => "audit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "verification" => Some(Self::Verification),
            "cleanup" => Some(Self::Cleanup),
            "audit" => Some(Self::Audit),
            _ => None,
        }
    }
}

/// Cleanup job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupJobStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl CleanupJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Failed) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Partial) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Cancelled) => true,
            _ => false,
        }
    }
}

/// How a cleanup job was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Manual,
    Scheduled,
    Api,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Api => "api",
        }
    }
}

/// Persisted configuration of one cleanup job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CleanupJobConfig {
    pub dry_run: bool,
    pub include_directories: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    pub max_files_to_process: u64,
    pub retention_days: u32,
}

/// Aggregate job metrics.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CleanupMetrics {
    pub files_scanned: u64,
    pub files_processed: u64,
    pub orphaned_files_found: u64,
    pub files_deleted: u64,
    pub deletion_errors: u64,
    pub storage_reclaimed_bytes: u64,
}

/// Per-object status inside a job's itemized result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanFileStatus {
    Found,
    Deleted,
    Failed,
    Skipped,
}

/// One object in a job's itemized result list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OrphanedFileEntry {
    pub key: String,
    pub size_bytes: u64,
    pub status: OrphanFileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
