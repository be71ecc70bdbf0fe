//! Application state shared across handlers.

use depot_core::config::AppConfig;
use depot_metadata::MetadataStore;
use depot_metadata::repos::CleanupJobRepo;
use depot_metadata::repos::cleanup_jobs::CleanupJobStatus;
use depot_storage::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Registry for tracking background cleanup tasks and detecting panics.
///
/// A panicked cleanup task would otherwise leave its job in `running`
/// forever, blocking future jobs through the single-flight guard until a
/// restart. The registry tracks spawned tasks and marks panicked jobs as
/// failed, restoring the job type within ~10s.
pub struct CleanupTaskRegistry {
    /// Map of job_id -> task handle
    tasks: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    /// Metadata store for updating job state
    metadata: Arc<dyn MetadataStore>,
}

impl CleanupTaskRegistry {
    /// Create a new cleanup task registry.
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            metadata,
        }
    }

    /// Register a spawned cleanup task.
    pub async fn register(&self, job_id: Uuid, handle: JoinHandle<()>) {
        self.tasks.lock().await.insert(job_id, handle);
    }

    /// Spawn a watchdog task that periodically checks for panicked tasks.
    /// Returns the watchdog's JoinHandle (caller keeps it alive).
    pub fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                self.check_tasks().await;
            }
        })
    }

    /// Check all tracked tasks for completion or panics.
    pub async fn check_tasks(&self) {
        let mut finished_handles = Vec::new();

        // Collect finished task handles, holding the mutex only briefly.
        {
            let mut tasks = self.tasks.lock().await;
            let finished_jobs: Vec<Uuid> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(job_id, _)| *job_id)
                .collect();

            for job_id in finished_jobs {
                if let Some(handle) = tasks.remove(&job_id) {
                    finished_handles.push((job_id, handle));
                }
            }
        }

        for (job_id, handle) in finished_handles {
            match handle.await {
                Err(join_err) if join_err.is_panic() => {
                    crate::metrics::CLEANUP_JOBS_ACTIVE.dec();
                    crate::metrics::CLEANUP_JOBS_PANICKED.inc();
                    tracing::error!(
                        job_id = %job_id,
                        panic = ?join_err,
                        "Cleanup task panicked, marking job as failed"
                    );

                    let error_log = serde_json::json!(["cleanup task panicked"]).to_string();
                    if let Err(e) = self
                        .metadata
                        .update_cleanup_job(
                            job_id,
                            CleanupJobStatus::Failed.as_str(),
                            Some(time::OffsetDateTime::now_utc()),
                            None,
                            None,
                            None,
                            Some(&error_log),
                        )
                        .await
                    {
                        tracing::error!(
                            job_id = %job_id,
                            error = %e,
                            "Failed to mark panicked job as failed"
                        );
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {
                    crate::metrics::CLEANUP_JOBS_ACTIVE.dec();
                    tracing::warn!(job_id = %job_id, "Cleanup task was cancelled");
                }
                Ok(_) => {
                    tracing::debug!(job_id = %job_id, "Cleanup task completed");
                }
                Err(e) => {
                    crate::metrics::CLEANUP_JOBS_ACTIVE.dec();
                    tracing::error!(job_id = %job_id, error = ?e, "Cleanup task failed with unknown error");
                }
            }
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Cleanup task registry for panic detection.
    pub cleanup_tasks: Arc<CleanupTaskRegistry>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid; startup validates before
    /// accepting requests.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        cleanup_tasks: Arc<CleanupTaskRegistry>,
    ) -> Self {
        if let Err(error) = config.validate() {
            panic!("Invalid configuration: {}", error);
        }

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            cleanup_tasks,
        }
    }
}

/// Mark jobs stranded in `pending`/`running` by a previous process as
/// failed. Called once on startup, before the server accepts requests.
pub async fn recover_orphaned_jobs(metadata: &dyn MetadataStore) -> anyhow::Result<()> {
    let stranded = metadata.get_active_cleanup_jobs().await?;
    for job in stranded {
        tracing::warn!(
            job_id = %job.cleanup_job_id,
            job_type = %job.job_type,
            status = %job.status,
            "Marking cleanup job stranded by restart as failed"
        );
        let error_log =
            serde_json::json!(["job was active during server shutdown; marked failed on startup"])
                .to_string();
        metadata
            .update_cleanup_job(
                job.cleanup_job_id,
                CleanupJobStatus::Failed.as_str(),
                Some(time::OffsetDateTime::now_utc()),
                job.metrics_json.as_deref(),
                job.orphaned_files_json.as_deref(),
                job.execution_log_json.as_deref(),
                Some(&error_log),
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_metadata::SqliteStore;
    use depot_metadata::models::CleanupJobRow;
    use depot_storage::FilesystemBackend;
    use tempfile::tempdir;
    use time::OffsetDateTime;

    async fn build_metadata(temp: &tempfile::TempDir) -> Arc<dyn MetadataStore> {
        Arc::new(
            SqliteStore::new(temp.path().join("metadata.db"))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_app_state_construction() {
        let temp = tempdir().unwrap();
        let storage: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(temp.path().join("storage")).await.unwrap());
        let metadata = build_metadata(&temp).await;
        let registry = Arc::new(CleanupTaskRegistry::new(metadata.clone()));

        let state = AppState::new(AppConfig::for_testing(), storage, metadata, registry);
        assert!(state.config.server.metrics_enabled);
    }

    #[tokio::test]
    async fn test_recover_orphaned_jobs() {
        let temp = tempdir().unwrap();
        let metadata = build_metadata(&temp).await;

        let job = CleanupJobRow {
            cleanup_job_id: Uuid::new_v4(),
            job_type: "cleanup".to_string(),
            status: "running".to_string(),
            config_json: "{}".to_string(),
            metrics_json: None,
            orphaned_files_json: None,
            execution_log_json: None,
            error_log_json: None,
            triggered_by: "api".to_string(),
            executed_by: None,
            started_at: Some(OffsetDateTime::now_utc()),
            finished_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        metadata.create_cleanup_job(&job).await.unwrap();

        recover_orphaned_jobs(metadata.as_ref()).await.unwrap();

        let recovered = metadata
            .get_cleanup_job(job.cleanup_job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.status, "failed");
        assert!(recovered.error_log_json.unwrap().contains("shutdown"));
        assert!(metadata.get_active_cleanup_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watchdog_marks_panicked_job_failed() {
        let temp = tempdir().unwrap();
        let metadata = build_metadata(&temp).await;
        let registry = Arc::new(CleanupTaskRegistry::new(metadata.clone()));

        let job = CleanupJobRow {
            cleanup_job_id: Uuid::new_v4(),
            job_type: "cleanup".to_string(),
            status: "running".to_string(),
            config_json: "{}".to_string(),
            metrics_json: None,
            orphaned_files_json: None,
            execution_log_json: None,
            error_log_json: None,
            triggered_by: "api".to_string(),
            executed_by: None,
            started_at: Some(OffsetDateTime::now_utc()),
            finished_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        metadata.create_cleanup_job(&job).await.unwrap();

        let handle = tokio::spawn(async { panic!("boom") });
        registry.register(job.cleanup_job_id, handle).await;

        // Give the panicked task a moment to finish, then sweep.
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.check_tasks().await;

        let recovered = metadata
            .get_cleanup_job(job.cleanup_job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.status, "failed");
    }
}
