//! PostgreSQL metadata store.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{CleanupJobRow, MediaObjectRow};
use crate::repos::{CleanupJobRepo, MediaRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use depot_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let pool = Self::pool_options(max_connections, statement_timeout_ms)
            .connect(url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Create a store from individual connection parameters.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(username) = username {
            opts = opts.username(username);
        }
        if let Some(password) = password {
            opts = opts.password(password);
        }

        let ssl_mode = match ssl_mode.unwrap_or_default() {
            PgSslMode::Disable => SqlxPgSslMode::Disable,
            PgSslMode::Prefer => SqlxPgSslMode::Prefer,
            PgSslMode::Require => SqlxPgSslMode::Require,
        };
        opts = opts.ssl_mode(ssl_mode);

        let pool = Self::pool_options(max_connections, statement_timeout_ms)
            .connect_with(opts)
            .await?;
        Self::from_pool(pool).await
    }

    fn pool_options(
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> PgPoolOptions {
        let mut options = PgPoolOptions::new().max_connections(max_connections.max(1));

        // statement_timeout lets PostgreSQL cancel hung queries server-side.
        if let Some(timeout_ms) = statement_timeout_ms {
            options = options.after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {timeout_ms}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            });
        }

        options
    }

    async fn from_pool(pool: Pool<Postgres>) -> MetadataResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        tracing::info!("PostgreSQL metadata store ready");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_objects (
                media_id UUID PRIMARY KEY,
                filename TEXT NOT NULL,
                storage_prefix TEXT,
                storage_key TEXT NOT NULL UNIQUE,
                access_url TEXT,
                upload_status TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                submission_id UUID,
                submission_state TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ
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
                cleanup_job_id UUID PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                config_json TEXT NOT NULL,
                metrics_json TEXT,
                orphaned_files_json TEXT,
                execution_log_json TEXT,
                error_log_json TEXT,
                triggered_by TEXT NOT NULL,
                executed_by TEXT,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Single-flight guard: at most one active job per type.
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
impl MediaRepo for PostgresStore {
    async fn create_media_object(&self, row: &MediaObjectRow) -> MetadataResult<()> {
        match sqlx::query(
            r#"
            INSERT INTO media_objects (
                media_id, filename, storage_prefix, storage_key, access_url,
                upload_status, size_bytes, submission_id, submission_state,
                created_at, updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(MetadataError::AlreadyExists(row.storage_key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_media_object(&self, media_id: Uuid) -> MetadataResult<Option<MediaObjectRow>> {
        let row = sqlx::query_as::<_, MediaObjectRow>(
            "SELECT * FROM media_objects WHERE media_id = $1",
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
            "SELECT * FROM media_objects WHERE storage_key = $1",
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
            "UPDATE media_objects SET upload_status = $1, updated_at = $2 WHERE media_id = $3",
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
            "SELECT * FROM media_objects ORDER BY created_at, media_id LIMIT $1 OFFSET $2",
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
            "UPDATE media_objects SET upload_status = 'orphaned', updated_at = $1
             WHERE upload_status = 'staging' AND created_at < $2",
        )
        .bind(marked_at)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_media_object_by_key(&self, storage_key: &str) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM media_objects WHERE storage_key = $1")
            .bind(storage_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CleanupJobRepo for PostgresStore {
    async fn create_cleanup_job(&self, job: &CleanupJobRow) -> MetadataResult<()> {
        match sqlx::query(
            r#"
            INSERT INTO cleanup_jobs (
                cleanup_job_id, job_type, status, config_json, metrics_json,
                orphaned_files_json, execution_log_json, error_log_json,
                triggered_by, executed_by, started_at, finished_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
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
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(MetadataError::Constraint(format!(
                    "another {} job is already active",
                    job.job_type
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_cleanup_job(&self, job_id: Uuid) -> MetadataResult<Option<CleanupJobRow>> {
        let row = sqlx::query_as::<_, CleanupJobRow>(
            "SELECT * FROM cleanup_jobs WHERE cleanup_job_id = $1",
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
            "UPDATE cleanup_jobs SET status = $1, finished_at = $2, metrics_json = $3,
             orphaned_files_json = $4, execution_log_json = $5, error_log_json = $6
             WHERE cleanup_job_id = $7",
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
        let statuses: Vec<String> = from_statuses.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            "UPDATE cleanup_jobs SET status = $1
             WHERE cleanup_job_id = $2 AND status = ANY($3)",
        )
        .bind(to_status)
        .bind(job_id)
        .bind(&statuses)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_recent_cleanup_jobs(&self, limit: u32) -> MetadataResult<Vec<CleanupJobRow>> {
        let rows = sqlx::query_as::<_, CleanupJobRow>(
            "SELECT * FROM cleanup_jobs ORDER BY created_at DESC LIMIT $1",
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
