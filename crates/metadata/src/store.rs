//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{CleanupJobRow, MediaObjectRow};
use crate::repos::{CleanupJobRepo, MediaRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: MediaRepo + CleanupJobRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
///
/// Recommended for testing and small deployments; use PostgreSQL in
/// production.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // avoids persistent "database is locked" failures under test and
            // axum concurrency.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            "SQLite metadata store ready; use PostgreSQL for production deployments"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_objects (
                media_id BLOB PRIMARY KEY,
                filename TEXT NOT NULL,
                storage_prefix TEXT,
                storage_key TEXT NOT NULL UNIQUE,
                access_url TEXT,
                upload_status TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                submission_id BLOB,
                submission_state TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_media_objects_status
             ON media_objects(upload_status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cleanup_jobs (
                cleanup_job_id BLOB PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                config_json TEXT NOT NULL,
                metrics_json TEXT,
                orphaned_files_json TEXT,
                execution_log_json TEXT,
                error_log_json TEXT,
                triggered_by TEXT NOT NULL,
                executed_by TEXT,
                started_at TEXT,
                finished_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Single-flight guard: at most one active job per type. Concurrent
        // creation attempts lose with a UNIQUE violation instead of racing.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_cleanup_jobs_active
             ON cleanup_jobs(job_type) WHERE status IN ('pending', 'running')",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cleanup_jobs_created
             ON cleanup_jobs(created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaRepo for SqliteStore {
    async fn create_media_object(&self, row: &MediaObjectRow) -> MetadataResult<()> {
        match sqlx::query(
            r#"
            INSERT INTO media_objects (
                media_id, filename, storage_prefix, storage_key, access_url,
                upload_status, size_bytes, submission_id, submission_state,
                created_at, updated_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.media_id)
        .bind(&row.filename)
        .bind(&row.storage_prefix)
        .bind(&row.storage_key)
        .bind(&row.access_url)
        .bind(&row.upload_status)
        .bind(row.size_bytes)
        .bind(row.submission_id)
        .bind(&row.submission_state)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await
        {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.message().contains("UNIQUE constraint")
                    && db_err.message().contains("media_objects") =>
            {
                Err(MetadataError::AlreadyExists(row.storage_key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_media_object(&self, media_id: Uuid) -> MetadataResult<Option<MediaObjectRow>> {
        let row = sqlx::query_as::<_, MediaObjectRow>(
            "SELECT * FROM media_objects WHERE media_id = ?",
        )
        .bind(media_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_media_object_by_key(
        &self,
        storage_key: &str,
    ) -> MetadataResult<Option<MediaObjectRow>> {
        let row = sqlx::query_as::<_, MediaObjectRow>(
            "SELECT * FROM media_objects WHERE storage_key = ?",
        )
        .bind(storage_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_upload_status(
        &self,
        media_id: Uuid,
        status: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE media_objects SET upload_status = ?, updated_at = ? WHERE media_id = ?",
        )
        .bind(status)
        .bind(updated_at)
        .bind(media_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(media_id.to_string()));
        }
        Ok(())
    }

    async fn list_media_objects(
        &self,
        limit: u32,
        offset: u64,
    ) -> MetadataResult<Vec<MediaObjectRow>> {
        let rows = sqlx::query_as::<_, MediaObjectRow>(
            "SELECT * FROM media_objects ORDER BY created_at, media_id LIMIT ? OFFSET ?",
        )
        .bind(i64::from(limit))
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_media_objects(&self) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media_objects")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn mark_stale_staging(
        &self,
        cutoff: OffsetDateTime,
        marked_at: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE media_objects SET upload_status = 'orphaned', updated_at = ?
             WHERE upload_status = 'staging' AND created_at < ?",
        )
        .bind(marked_at)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_media_object_by_key(&self, storage_key: &str) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM media_objects WHERE storage_key = ?")
            .bind(storage_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CleanupJobRepo for SqliteStore {
    async fn create_cleanup_job(&self, job: &CleanupJobRow) -> MetadataResult<()> {
        match sqlx::query(
            r#"
            INSERT INTO cleanup_jobs (
                cleanup_job_id, job_type, status, config_json, metrics_json,
                orphaned_files_json, execution_log_json, error_log_json,
                triggered_by, executed_by, started_at, finished_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.cleanup_job_id)
        .bind(&job.job_type)
        .bind(&job.status)
        .bind(&job.config_json)
        .bind(&job.metrics_json)
        .bind(&job.orphaned_files_json)
        .bind(&job.execution_log_json)
        .bind(&job.error_log_json)
        .bind(&job.triggered_by)
        .bind(&job.executed_by)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) => {
                // SQLite reports the partial unique index violation either
                // with column names or with the index name; both mention
                // the table.
                let msg = db_err.message();
                if msg.contains("UNIQUE constraint") && msg.contains("cleanup_jobs") {
                    Err(MetadataError::Constraint(format!(
                        "another {} job is already active",
                        job.job_type
                    )))
                } else {
                    Err(sqlx::Error::Database(db_err).into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_cleanup_job(&self, job_id: Uuid) -> MetadataResult<Option<CleanupJobRow>> {
        let row = sqlx::query_as::<_, CleanupJobRow>(
            "SELECT * FROM cleanup_jobs WHERE cleanup_job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_cleanup_job(
        &self,
        job_id: Uuid,
        status: &str,
        finished_at: Option<OffsetDateTime>,
        metrics_json: Option<&str>,
        orphaned_files_json: Option<&str>,
        execution_log_json: Option<&str>,
        error_log_json: Option<&str>,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE cleanup_jobs SET status = ?, finished_at = ?, metrics_json = ?,
             orphaned_files_json = ?, execution_log_json = ?, error_log_json = ?
             WHERE cleanup_job_id = ?",
        )
        .bind(status)
        .bind(finished_at)
        .bind(metrics_json)
        .bind(orphaned_files_json)
        .bind(execution_log_json)
        .bind(error_log_json)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_cleanup_job_status(
        &self,
        job_id: Uuid,
        from_statuses: &[&str],
        to_status: &str,
    ) -> MetadataResult<u64> {
        // Build the IN list from the guard statuses. Status strings are
        // internal constants, never user input.
        let placeholders = vec!["?"; from_statuses.len()].join(", ");
        let sql = format!(
            "UPDATE cleanup_jobs SET status = ? WHERE cleanup_job_id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql).bind(to_status).bind(job_id);
        for status in from_statuses {
            query = query.bind(*status);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn list_recent_cleanup_jobs(&self, limit: u32) -> MetadataResult<Vec<CleanupJobRow>> {
        let rows = sqlx::query_as::<_, CleanupJobRow>(
            "SELECT * FROM cleanup_jobs ORDER BY created_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_active_cleanup_jobs(&self) -> MetadataResult<Vec<CleanupJobRow>> {
        let rows = sqlx::query_as::<_, CleanupJobRow>(
            "SELECT * FROM cleanup_jobs WHERE status IN ('pending', 'running')
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
