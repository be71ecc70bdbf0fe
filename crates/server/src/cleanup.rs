//! Orphan reconciliation: scanning, cleanup execution, and job running.
//!
//! A scan pages object storage under allow-listed prefixes, subtracts every
//! key the metadata store knows about, and surfaces objects older than the
//! retention window as orphan candidates. Execution deletes an explicit,
//! validated key list in storage-API-limited batches, never retrying failed
//! deletes itself. Both paths persist a full audit record on their cleanup
//! job row.

use crate::error::{ApiError, ApiResult};
use depot_core::MAX_KEY_LENGTH;
use depot_core::media::is_submission_terminal;
use depot_metadata::MetadataStore;
use depot_metadata::models::MediaObjectRow;
use depot_metadata::repos::cleanup_jobs::{
    CleanupJobConfig, CleanupJobStatus, CleanupMetrics, OrphanFileStatus, OrphanedFileEntry,
};
use depot_metadata::repos::{CleanupJobRepo, MediaRepo};
use depot_storage::{ObjectStore, StorageError};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashSet;
use time::OffsetDateTime;
use uuid::Uuid;

/// Keys fetched per storage listing page during a scan.
const SCAN_PAGE_SIZE: usize = 1000;

/// Media rows fetched per metadata page while building the valid-key set.
const VALID_SET_PAGE_SIZE: u32 = 500;

/// Upper bound on the key list accepted by one execute request.
pub const MAX_KEYS_PER_EXECUTE: usize = 10_000;

/// One orphan candidate surfaced by a scan. Transient scan output; the
/// persisted form lives in the job's itemized result list.
#[derive(Clone, Debug, Serialize)]
pub struct OrphanCandidate {
    pub key: String,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

/// Aggregate metrics of one scan.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ScanMetrics {
    pub files_scanned: u64,
    pub orphans_found: u64,
    pub reclaimable_bytes: u64,
    /// Tracked staging rows aged to orphaned by this scan.
    pub stale_records_marked: u64,
}

/// Result of a scan: candidates plus aggregate metrics.
#[derive(Clone, Debug)]
pub struct ScanOutcome {
    pub candidates: Vec<OrphanCandidate>,
    pub metrics: ScanMetrics,
}

/// Validate requested scan prefixes against the configured allow-list.
///
/// An empty request scans every allowed prefix. Any prefix that is not
/// covered by the allow-list, contains a parent-directory token, or is
/// absolute is rejected before any storage call.
pub fn validate_scan_prefixes(
    requested: &[String],
    allowed: &[String],
) -> ApiResult<Vec<String>> {
    if requested.is_empty() {
        return Ok(allowed.to_vec());
    }

    let mut prefixes = Vec::with_capacity(requested.len());
    for prefix in requested {
        if prefix.is_empty() || prefix.contains("..") || prefix.starts_with('/') {
            return Err(ApiError::BadRequest(format!(
                "unsafe scan prefix: {prefix:?}"
            )));
        }
        if !allowed.iter().any(|allow| prefix.starts_with(allow)) {
            return Err(ApiError::BadRequest(format!(
                "scan prefix not on the allow-list: {prefix:?}"
            )));
        }
        prefixes.push(prefix.clone());
    }
    Ok(prefixes)
}

/// Insert a key into the valid set, both literally and URL-decoded.
fn insert_key_forms(keys: &mut HashSet<String>, key: &str) {
    if key.is_empty() {
        return;
    }
    keys.insert(key.to_string());
    if let Ok(decoded) = percent_decode_str(key).decode_utf8()
        && decoded != key
    {
        keys.insert(decoded.into_owned());
    }
}

/// Extract the object path from a stored access URL.
fn key_from_access_url(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest)?;
    let (_host, path) = rest.split_once('/')?;
    let path = path.split(['?', '#']).next().unwrap_or(path);
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// Register every key form under which a media row may appear in storage.
fn insert_row_keys(keys: &mut HashSet<String>, row: &MediaObjectRow) {
    insert_key_forms(keys, &row.storage_key);

    match &row.storage_prefix {
        Some(prefix) => {
            let joined = format!("{}/{}", prefix.trim_end_matches('/'), row.filename);
            insert_key_forms(keys, &joined);
        }
        // Legacy rows without a prefix were stored under the bare filename.
        None => insert_key_forms(keys, &row.filename),
    }

    if let Some(url) = &row.access_url
        && let Some(path) = key_from_access_url(url)
    {
        insert_key_forms(keys, &path);
        // Path-style URLs carry the bucket as the first segment.
        if let Some((_, rest)) = path.split_once('/') {
            insert_key_forms(keys, rest);
        }
    }
}

/// Check a listed key against the valid set, literally and URL-decoded.
fn is_tracked(valid_keys: &HashSet<String>, key: &str) -> bool {
    if valid_keys.contains(key) {
        return true;
    }
    if let Ok(decoded) = percent_decode_str(key).decode_utf8()
        && valid_keys.contains(decoded.as_ref())
    {
        return true;
    }
    false
}

/// Scans object storage for orphan candidates.
pub struct OrphanScanner<'a> {
    storage: &'a dyn ObjectStore,
    metadata: &'a dyn MetadataStore,
}

impl<'a> OrphanScanner<'a> {
    pub fn new(storage: &'a dyn ObjectStore, metadata: &'a dyn MetadataStore) -> Self {
        Self { storage, metadata }
    }

    /// Build the set of storage keys the metadata store accounts for.
    ///
    /// The full materialization trades memory for O(1) membership checks
    /// during the scan, which is acceptable at expected catalog sizes.
    async fn build_valid_key_set(&self) -> ApiResult<HashSet<String>> {
        let mut keys = HashSet::new();
        let mut offset = 0u64;
        loop {
            let rows = self
                .metadata
                .list_media_objects(VALID_SET_PAGE_SIZE, offset)
                .await?;
            let fetched = rows.len();
            for row in &rows {
                insert_row_keys(&mut keys, row);
            }
            if fetched < VALID_SET_PAGE_SIZE as usize {
                break;
            }
            offset += fetched as u64;
        }
        Ok(keys)
    }

    /// Run a scan over the configured prefixes.
    ///
    /// Objects younger than the retention window are never reported, since
    /// they may be uploads still being reconciled; objects the backend
    /// cannot date are protected the same way.
    pub async fn scan(&self, config: &CleanupJobConfig, job_id: Uuid) -> ApiResult<ScanOutcome> {
        let now = OffsetDateTime::now_utc();
        let retention = time::Duration::days(i64::from(config.retention_days));
        let cutoff = now - retention;

        // Age tracked rows first: staging entries past the retention window
        // become orphaned in the metadata store.
        let stale_records_marked = self.metadata.mark_stale_staging(cutoff, now).await?;
        if stale_records_marked > 0 {
            tracing::info!(
                job_id = %job_id,
                marked = stale_records_marked,
                "Aged stale staging records to orphaned"
            );
        }

        let valid_keys = self.build_valid_key_set().await?;
        tracing::debug!(
            job_id = %job_id,
            valid_keys = valid_keys.len(),
            "Built valid-key set from metadata"
        );

        let mut metrics = ScanMetrics {
            stale_records_marked,
            ..Default::default()
        };
        let mut candidates = Vec::new();

        'prefixes: for prefix in &config.include_directories {
            let mut token: Option<String> = None;
            loop {
                let page = self
                    .storage
                    .list_page(prefix, token.as_deref(), SCAN_PAGE_SIZE)
                    .await?;
                crate::metrics::SCAN_PAGES_FETCHED.inc();

                for entry in page.entries {
                    if metrics.files_scanned >= config.max_files_to_process {
                        tracing::warn!(
                            job_id = %job_id,
                            files_scanned = metrics.files_scanned,
                            ceiling = config.max_files_to_process,
                            "Scan reached the file ceiling, stopping (re-run to continue)"
                        );
                        break 'prefixes;
                    }
                    metrics.files_scanned += 1;

                    // Directory marker keys carry no bytes.
                    if entry.key.ends_with('/') {
                        continue;
                    }
                    if config
                        .exclude_patterns
                        .iter()
                        .any(|pattern| entry.key.contains(pattern.as_str()))
                    {
                        continue;
                    }
                    if is_tracked(&valid_keys, &entry.key) {
                        continue;
                    }

                    // Undated objects cannot be verified old; protect them.
                    let Some(last_modified) = entry.last_modified else {
                        tracing::warn!(
                            job_id = %job_id,
                            key = %entry.key,
                            "Object has no last-modified timestamp, protecting from reclamation"
                        );
                        continue;
                    };
                    if now - last_modified <= retention {
                        continue;
                    }

                    metrics.orphans_found += 1;
                    metrics.reclaimable_bytes += entry.size;
                    candidates.push(OrphanCandidate {
                        key: entry.key,
                        size_bytes: entry.size,
                        last_modified,
                    });
                }

                match page.next_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        }

        crate::metrics::ORPHANS_FOUND.inc_by(metrics.orphans_found);
        tracing::info!(
            job_id = %job_id,
            files_scanned = metrics.files_scanned,
            orphans_found = metrics.orphans_found,
            reclaimable_bytes = metrics.reclaimable_bytes,
            "Orphan scan finished"
        );

        Ok(ScanOutcome {
            candidates,
            metrics,
        })
    }
}

/// Result of executing a cleanup over an explicit key list.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOutcome {
    pub deleted: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_reclaimed: u64,
    /// Itemized per-key result, persisted on the job row.
    pub items: Vec<OrphanedFileEntry>,
    /// Batch-level error messages.
    pub errors: Vec<String>,
    /// Whether a cancellation request stopped the run early.
    pub cancelled: bool,
}

/// Deletes validated key lists from storage in bounded batches.
pub struct CleanupExecutor<'a> {
    storage: &'a dyn ObjectStore,
    metadata: &'a dyn MetadataStore,
    batch_size: usize,
}

impl<'a> CleanupExecutor<'a> {
    pub fn new(
        storage: &'a dyn ObjectStore,
        metadata: &'a dyn MetadataStore,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            metadata,
            batch_size: batch_size.clamp(1, depot_storage::MAX_DELETE_BATCH),
        }
    }

    /// Validate an explicit key list before any storage call.
    ///
    /// Defense in depth: the scan already filters keys, but execution
    /// accepts caller-supplied lists and re-checks everything.
    pub fn validate_keys(keys: &[String]) -> ApiResult<()> {
        if keys.is_empty() {
            return Err(ApiError::BadRequest("empty key list".to_string()));
        }
        if keys.len() > MAX_KEYS_PER_EXECUTE {
            return Err(ApiError::BadRequest(format!(
                "key list of {} exceeds the limit of {}",
                keys.len(),
                MAX_KEYS_PER_EXECUTE
            )));
        }
        for key in keys {
            if key.is_empty() {
                return Err(ApiError::BadRequest("empty key".to_string()));
            }
            if key.len() > MAX_KEY_LENGTH {
                return Err(ApiError::BadRequest(format!(
                    "key exceeds {MAX_KEY_LENGTH} bytes"
                )));
            }
            if key.contains("..") || key.starts_with('/') {
                return Err(ApiError::BadRequest(format!("unsafe key: {key:?}")));
            }
        }
        Ok(())
    }

    /// Whether the job has been cancelled. Checked between batches only;
    /// an issued delete call always completes.
    async fn is_cancelled(&self, job_id: Uuid) -> bool {
        match self.metadata.get_cleanup_job(job_id).await {
            Ok(Some(job)) => job.status == CleanupJobStatus::Cancelled.as_str(),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read job status");
                false
            }
        }
    }

    /// Execute a cleanup over an explicit key list.
    ///
    /// In dry-run mode, zero delete calls are made and `deleted` is 0.
    /// Otherwise keys are deleted in storage-API-limited batches; a
    /// whole-batch transport failure attributes failure to every key in
    /// that batch. Failed deletes are reported, never auto-retried.
    pub async fn execute(
        &self,
        job_id: Uuid,
        keys: &[String],
        dry_run: bool,
    ) -> ApiResult<ExecutionOutcome> {
        Self::validate_keys(keys)?;

        let mut outcome = ExecutionOutcome::default();

        // Partition the list: keys whose metadata row is confirmed and
        // back-referenced by a live submission are skipped, never
        // force-deleted (reconciliation race discovered mid-cleanup).
        let mut deletable: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            let row = self.metadata.get_media_object_by_key(key).await?;
            let protected = row.as_ref().is_some_and(|row| {
                row.upload_status == "confirmed"
                    && !row
                        .submission_state
                        .as_deref()
                        .is_some_and(is_submission_terminal)
            });
            if protected {
                tracing::warn!(
                    job_id = %job_id,
                    key = %key,
                    "Key is referenced by a live submission, skipping"
                );
                outcome.skipped += 1;
                outcome.items.push(OrphanedFileEntry {
                    key: key.clone(),
                    size_bytes: row.map(|r| r.size_bytes.max(0) as u64).unwrap_or(0),
                    status: OrphanFileStatus::Skipped,
                    error: Some("referenced by a live submission".to_string()),
                });
            } else {
                deletable.push(key.clone());
            }
        }

        if dry_run {
            for key in &deletable {
                let size_bytes = self.object_size(key).await;
                outcome.bytes_reclaimed += size_bytes;
                outcome.items.push(OrphanedFileEntry {
                    key: key.clone(),
                    size_bytes,
                    status: OrphanFileStatus::Found,
                    error: None,
                });
            }
            tracing::info!(
                job_id = %job_id,
                keys = deletable.len(),
                "DRY-RUN: would delete keys, no delete calls issued"
            );
            return Ok(outcome);
        }

        let batches: Vec<&[String]> = deletable.chunks(self.batch_size).collect();
        for (batch_index, batch) in batches.iter().enumerate() {
            if self.is_cancelled(job_id).await {
                tracing::warn!(
                    job_id = %job_id,
                    batch = batch_index,
                    "Cancellation observed, stopping before next batch"
                );
                outcome.cancelled = true;
                for key in batches[batch_index..].iter().flat_map(|chunk| chunk.iter()) {
                    outcome.skipped += 1;
                    outcome.items.push(OrphanedFileEntry {
                        key: key.clone(),
                        size_bytes: 0,
                        status: OrphanFileStatus::Skipped,
                        error: Some("job cancelled".to_string()),
                    });
                }
                break;
            }

            // Sizes are read before deletion so reclaimed bytes can be
            // reported afterwards.
            let mut sizes = std::collections::HashMap::new();
            for key in batch.iter() {
                sizes.insert(key.clone(), self.object_size(key).await);
            }

            match self.storage.delete_objects(batch).await {
                Ok(result) => {
                    for key in result.deleted {
                        let size_bytes = sizes.get(&key).copied().unwrap_or(0);
                        outcome.deleted += 1;
                        outcome.bytes_reclaimed += size_bytes;
                        crate::metrics::FILES_DELETED.inc();

                        // Remove the metadata record for the deleted object.
                        if let Err(e) = self.metadata.delete_media_object_by_key(&key).await {
                            tracing::warn!(
                                job_id = %job_id,
                                key = %key,
                                error = %e,
                                "Failed to remove metadata record for deleted object"
                            );
                        }

                        outcome.items.push(OrphanedFileEntry {
                            key,
                            size_bytes,
                            status: OrphanFileStatus::Deleted,
                            error: None,
                        });
                    }
                    for failure in result.failed {
                        tracing::warn!(
                            job_id = %job_id,
                            key = %failure.key,
                            error = %failure.message,
                            "Failed to delete object"
                        );
                        outcome.failed += 1;
                        outcome.errors.push(format!("{}: {}", failure.key, failure.message));
                        outcome.items.push(OrphanedFileEntry {
                            key: failure.key,
                            size_bytes: 0,
                            status: OrphanFileStatus::Failed,
                            error: Some(failure.message),
                        });
                    }
                }
                Err(e) => {
                    // Whole-batch transport failure: every key in the batch
                    // is reported failed rather than dropped silently.
                    tracing::error!(
                        job_id = %job_id,
                        batch = batch_index,
                        keys = batch.len(),
                        error = %e,
                        "Batch delete call failed"
                    );
                    let message = e.to_string();
                    outcome.errors.push(format!("batch {batch_index}: {message}"));
                    for key in batch.iter() {
                        outcome.failed += 1;
                        outcome.items.push(OrphanedFileEntry {
                            key: key.clone(),
                            size_bytes: 0,
                            status: OrphanFileStatus::Failed,
                            error: Some(message.clone()),
                        });
                    }
                }
            }
        }

        crate::metrics::BYTES_RECLAIMED.inc_by(outcome.bytes_reclaimed);
        Ok(outcome)
    }

    async fn object_size(&self, key: &str) -> u64 {
        match self.storage.head(key).await {
            Ok(meta) => meta.size,
            Err(StorageError::NotFound(_)) => 0,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Failed to size object");
                0
            }
        }
    }
}

/// Drive an execute-type cleanup job to a terminal state, persisting the
/// audit record whatever happens.
pub async fn run_cleanup_job(
    job_id: Uuid,
    keys: Vec<String>,
    dry_run: bool,
    storage: std::sync::Arc<dyn ObjectStore>,
    metadata: std::sync::Arc<dyn MetadataStore>,
    batch_size: usize,
) {
    let started = OffsetDateTime::now_utc();
    let mut execution_log = vec![format!("{started} job started, {} keys", keys.len())];

    let executor = CleanupExecutor::new(storage.as_ref(), metadata.as_ref(), batch_size);
    let result = executor.execute(job_id, &keys, dry_run).await;

    let finished = OffsetDateTime::now_utc();
    let (status, metrics, items, errors) = match result {
        Ok(outcome) => {
            execution_log.push(format!(
                "{finished} deleted={} failed={} skipped={} reclaimed_bytes={}",
                outcome.deleted, outcome.failed, outcome.skipped, outcome.bytes_reclaimed
            ));

            let status = if outcome.cancelled {
                CleanupJobStatus::Cancelled
            } else if outcome.failed > 0 {
                CleanupJobStatus::Partial
            } else {
                CleanupJobStatus::Completed
            };

            let metrics = CleanupMetrics {
                files_scanned: 0,
                files_processed: keys.len() as u64,
                orphaned_files_found: keys.len() as u64,
                files_deleted: outcome.deleted,
                deletion_errors: outcome.failed,
                storage_reclaimed_bytes: outcome.bytes_reclaimed,
            };
            (status, metrics, outcome.items, outcome.errors)
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Cleanup job failed");
            execution_log.push(format!("{finished} job failed: {e}"));
            (
                CleanupJobStatus::Failed,
                CleanupMetrics::default(),
                Vec::new(),
                vec![e.to_string()],
            )
        }
    };

    let metrics_json = serde_json::to_string(&metrics).ok();
    let items_json = serde_json::to_string(&items).ok();
    let log_json = serde_json::to_string(&execution_log).ok();
    let errors_json = if errors.is_empty() {
        None
    } else {
        serde_json::to_string(&errors).ok()
    };

    if let Err(e) = metadata
        .update_cleanup_job(
            job_id,
            status.as_str(),
            Some(finished),
            metrics_json.as_deref(),
            items_json.as_deref(),
            log_json.as_deref(),
            errors_json.as_deref(),
        )
        .await
    {
        tracing::error!(job_id = %job_id, error = %e, "Failed to persist cleanup job result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use depot_metadata::SqliteStore;
    use depot_metadata::models::CleanupJobRow;
    use depot_storage::traits::{BatchDeleteOutcome, DeleteFailure, ListingPage, ObjectMeta};
    use depot_storage::{FilesystemBackend, StorageResult};
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn sqlite_store(temp: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::new(temp.path().join("metadata.db")).await.unwrap()
    }

    fn media_row(key: &str) -> MediaObjectRow {
        let now = OffsetDateTime::now_utc();
        MediaObjectRow {
            media_id: Uuid::new_v4(),
            filename: key.rsplit('/').next().unwrap_or(key).to_string(),
            storage_prefix: Some("media".to_string()),
            storage_key: key.to_string(),
            access_url: None,
            upload_status: "staging".to_string(),
            size_bytes: 42,
            submission_id: None,
            submission_state: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    fn scan_config(retention_days: u32) -> CleanupJobConfig {
        CleanupJobConfig {
            dry_run: true,
            include_directories: vec!["media/".to_string()],
            exclude_patterns: Vec::new(),
            max_files_to_process: 10_000,
            retention_days,
        }
    }

    /// Rewind a stored object's modification time.
    fn age_object(root: &std::path::Path, key: &str, days: u64) {
        let path = root.join(key);
        let mtime = std::time::SystemTime::now()
            - std::time::Duration::from_secs(days * 24 * 60 * 60);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_times(std::fs::FileTimes::new().set_modified(mtime))
            .unwrap();
    }

    #[test]
    fn test_validate_scan_prefixes() {
        let allowed = vec!["media/".to_string(), "attachments/".to_string()];

        // Empty request falls back to the allow-list.
        let prefixes = validate_scan_prefixes(&[], &allowed).unwrap();
        assert_eq!(prefixes, allowed);

        // Sub-prefixes of an allowed prefix pass.
        let prefixes =
            validate_scan_prefixes(&["media/2026/".to_string()], &allowed).unwrap();
        assert_eq!(prefixes, vec!["media/2026/"]);

        for bad in ["private/", "../media/", "/media/", ""] {
            assert!(
                validate_scan_prefixes(&[bad.to_string()], &allowed).is_err(),
                "prefix {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_keys() {
        assert!(CleanupExecutor::validate_keys(&["media/ok.pdf".to_string()]).is_ok());
        assert!(CleanupExecutor::validate_keys(&[]).is_err());
        assert!(
            CleanupExecutor::validate_keys(&["../../etc/passwd".to_string()]).is_err()
        );
        assert!(CleanupExecutor::validate_keys(&["/etc/passwd".to_string()]).is_err());
        assert!(CleanupExecutor::validate_keys(&["".to_string()]).is_err());
        assert!(CleanupExecutor::validate_keys(&["x".repeat(2000)]).is_err());
    }

    #[test]
    fn test_key_from_access_url() {
        assert_eq!(
            key_from_access_url("https://cdn.example.gov/media/abc/file.pdf"),
            Some("media/abc/file.pdf".to_string())
        );
        assert_eq!(
            key_from_access_url("https://cdn.example.gov/media/a.pdf?sig=x"),
            Some("media/a.pdf".to_string())
        );
        assert_eq!(key_from_access_url("not-a-url"), None);
        assert_eq!(key_from_access_url("https://host"), None);
    }

    #[tokio::test]
    async fn test_scan_flags_only_old_untracked_objects() {
        let temp = tempdir().unwrap();
        let storage_root = temp.path().join("storage");
        let storage = FilesystemBackend::new(&storage_root).await.unwrap();
        let metadata = sqlite_store(&temp).await;

        // Tracked object: old but known to the metadata store.
        storage
            .put("media/tracked.pdf", Bytes::from_static(b"tracked"))
            .await
            .unwrap();
        metadata
            .create_media_object(&media_row("media/tracked.pdf"))
            .await
            .unwrap();
        age_object(&storage_root, "media/tracked.pdf", 40);

        // Untracked and old: the one real orphan.
        storage
            .put("media/orphan.pdf", Bytes::from_static(b"orphan-data"))
            .await
            .unwrap();
        age_object(&storage_root, "media/orphan.pdf", 40);

        // Untracked but young: still within the retention window.
        storage
            .put("media/recent.pdf", Bytes::from_static(b"recent"))
            .await
            .unwrap();
        age_object(&storage_root, "media/recent.pdf", 10);

        let scanner = OrphanScanner::new(&storage, &metadata);
        let outcome = scanner.scan(&scan_config(30), Uuid::new_v4()).await.unwrap();

        assert_eq!(outcome.metrics.files_scanned, 3);
        assert_eq!(outcome.metrics.orphans_found, 1);
        assert_eq!(outcome.candidates.len(), 1);
        let candidate = &outcome.candidates[0];
        assert_eq!(candidate.key, "media/orphan.pdf");
        assert_eq!(candidate.size_bytes, 11);
        assert!(
            OffsetDateTime::now_utc() - candidate.last_modified > time::Duration::days(30)
        );
        assert_eq!(outcome.metrics.reclaimable_bytes, 11);
    }

    #[tokio::test]
    async fn test_scan_respects_url_decoded_keys() {
        let temp = tempdir().unwrap();
        let storage_root = temp.path().join("storage");
        let storage = FilesystemBackend::new(&storage_root).await.unwrap();
        let metadata = sqlite_store(&temp).await;

        // The stored key has a space; the metadata row only knows the
        // percent-encoded access URL.
        storage
            .put("media/report 2024.pdf", Bytes::from_static(b"x"))
            .await
            .unwrap();
        age_object(&storage_root, "media/report 2024.pdf", 60);

        let mut row = media_row("media/other-key.pdf");
        row.access_url =
            Some("https://cdn.example.gov/media/report%202024.pdf".to_string());
        metadata.create_media_object(&row).await.unwrap();

        let scanner = OrphanScanner::new(&storage, &metadata);
        let outcome = scanner.scan(&scan_config(30), Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome.metrics.orphans_found, 0);
    }

    #[tokio::test]
    async fn test_scan_marks_stale_staging_rows() {
        let temp = tempdir().unwrap();
        let storage = FilesystemBackend::new(temp.path().join("storage")).await.unwrap();
        let metadata = sqlite_store(&temp).await;

        let mut stale = media_row("media/stale.pdf");
        stale.created_at = OffsetDateTime::now_utc() - time::Duration::days(45);
        metadata.create_media_object(&stale).await.unwrap();

        let scanner = OrphanScanner::new(&storage, &metadata);
        let outcome = scanner.scan(&scan_config(30), Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome.metrics.stale_records_marked, 1);

        let row = metadata
            .get_media_object(stale.media_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.upload_status, "orphaned");
    }

    #[tokio::test]
    async fn test_scan_honors_exclude_patterns_and_ceiling() {
        let temp = tempdir().unwrap();
        let storage_root = temp.path().join("storage");
        let storage = FilesystemBackend::new(&storage_root).await.unwrap();
        let metadata = sqlite_store(&temp).await;

        for name in ["media/a.pdf", "media/keep/b.pdf", "media/c.pdf"] {
            storage.put(name, Bytes::from_static(b"x")).await.unwrap();
            age_object(&storage_root, name, 60);
        }

        let mut config = scan_config(30);
        config.exclude_patterns = vec!["keep/".to_string()];
        let scanner = OrphanScanner::new(&storage, &metadata);
        let outcome = scanner.scan(&config, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome.metrics.orphans_found, 2);

        let mut config = scan_config(30);
        config.max_files_to_process = 1;
        let outcome = scanner.scan(&config, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome.metrics.files_scanned, 1);
    }

    #[tokio::test]
    async fn test_execute_dry_run_deletes_nothing() {
        let temp = tempdir().unwrap();
        let storage = FilesystemBackend::new(temp.path().join("storage")).await.unwrap();
        let metadata = sqlite_store(&temp).await;

        storage
            .put("media/orphan.pdf", Bytes::from_static(b"orphan"))
            .await
            .unwrap();

        let executor = CleanupExecutor::new(&storage, &metadata, 1000);
        let outcome = executor
            .execute(
                Uuid::new_v4(),
                &["media/orphan.pdf".to_string()],
                true,
            )
            .await
            .unwrap();

        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.failed, 0);
        assert!(storage.exists("media/orphan.pdf").await.unwrap());
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].status, OrphanFileStatus::Found);
    }

    #[tokio::test]
    async fn test_execute_deletes_objects_and_metadata() {
        let temp = tempdir().unwrap();
        let storage = FilesystemBackend::new(temp.path().join("storage")).await.unwrap();
        let metadata = sqlite_store(&temp).await;

        storage
            .put("media/orphan.pdf", Bytes::from_static(b"orphaned"))
            .await
            .unwrap();
        let mut row = media_row("media/orphan.pdf");
        row.upload_status = "orphaned".to_string();
        metadata.create_media_object(&row).await.unwrap();

        let executor = CleanupExecutor::new(&storage, &metadata, 1000);
        let outcome = executor
            .execute(
                Uuid::new_v4(),
                &["media/orphan.pdf".to_string()],
                false,
            )
            .await
            .unwrap();

        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.bytes_reclaimed, 8);
        assert!(!storage.exists("media/orphan.pdf").await.unwrap());
        assert!(
            metadata
                .get_media_object_by_key("media/orphan.pdf")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_execute_skips_live_submission_reference() {
        let temp = tempdir().unwrap();
        let storage = FilesystemBackend::new(temp.path().join("storage")).await.unwrap();
        let metadata = sqlite_store(&temp).await;

        storage
            .put("media/referenced.pdf", Bytes::from_static(b"keep"))
            .await
            .unwrap();
        let mut row = media_row("media/referenced.pdf");
        row.upload_status = "confirmed".to_string();
        row.submission_id = Some(Uuid::new_v4());
        row.submission_state = Some("processing".to_string());
        metadata.create_media_object(&row).await.unwrap();

        let executor = CleanupExecutor::new(&storage, &metadata, 1000);
        let outcome = executor
            .execute(
                Uuid::new_v4(),
                &["media/referenced.pdf".to_string()],
                false,
            )
            .await
            .unwrap();

        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.skipped, 1);
        assert!(storage.exists("media/referenced.pdf").await.unwrap());
        assert_eq!(outcome.items[0].status, OrphanFileStatus::Skipped);
    }

    /// Storage stub whose batch deletes fail for chosen keys (or entirely).
    struct FlakyStorage {
        fail_keys: Vec<String>,
        fail_whole_batch: bool,
    }

    #[async_trait]
    impl ObjectStore for FlakyStorage {
        async fn exists(&self, _key: &str) -> StorageResult<bool> {
            Ok(true)
        }

        async fn head(&self, _key: &str) -> StorageResult<ObjectMeta> {
            Ok(ObjectMeta {
                size: 10,
                last_modified: None,
                content_type: None,
            })
        }

        async fn get(&self, key: &str) -> StorageResult<Bytes> {
            Err(StorageError::NotFound(key.to_string()))
        }

        async fn put(&self, _key: &str, _data: Bytes) -> StorageResult<()> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> StorageResult<()> {
            Ok(())
        }

        async fn delete_objects(&self, keys: &[String]) -> StorageResult<BatchDeleteOutcome> {
            if self.fail_whole_batch {
                return Err(StorageError::Io(std::io::Error::other("connection reset")));
            }
            let mut outcome = BatchDeleteOutcome::default();
            for key in keys {
                if self.fail_keys.contains(key) {
                    outcome.failed.push(DeleteFailure {
                        key: key.clone(),
                        message: "InternalError: delete failed".to_string(),
                    });
                } else {
                    outcome.deleted.push(key.clone());
                }
            }
            Ok(outcome)
        }

        async fn list_page(
            &self,
            _prefix: &str,
            _token: Option<&str>,
            _max_keys: usize,
        ) -> StorageResult<ListingPage> {
            Ok(ListingPage {
                entries: Vec::new(),
                next_token: None,
            })
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_execute_partial_failure() {
        let temp = tempdir().unwrap();
        let metadata = sqlite_store(&temp).await;
        let storage = FlakyStorage {
            fail_keys: vec!["media/bad-1".to_string(), "media/bad-2".to_string()],
            fail_whole_batch: false,
        };

        let keys: Vec<String> = (0..12)
            .map(|i| {
                if i < 2 {
                    format!("media/bad-{}", i + 1)
                } else {
                    format!("media/good-{i}")
                }
            })
            .collect();

        let executor = CleanupExecutor::new(&storage, &metadata, 1000);
        let outcome = executor.execute(Uuid::new_v4(), &keys, false).await.unwrap();

        assert_eq!(outcome.deleted, 10);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_execute_whole_batch_failure_attributes_every_key() {
        let temp = tempdir().unwrap();
        let metadata = sqlite_store(&temp).await;
        let storage = FlakyStorage {
            fail_keys: Vec::new(),
            fail_whole_batch: true,
        };

        let keys: Vec<String> = (0..3).map(|i| format!("media/k{i}")).collect();
        let executor = CleanupExecutor::new(&storage, &metadata, 1000);
        let outcome = executor.execute(Uuid::new_v4(), &keys, false).await.unwrap();

        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.failed, 3);
        assert!(
            outcome
                .items
                .iter()
                .all(|item| item.status == OrphanFileStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_run_cleanup_job_partial_status() {
        let temp = tempdir().unwrap();
        let metadata = Arc::new(sqlite_store(&temp).await);
        let storage: Arc<dyn ObjectStore> = Arc::new(FlakyStorage {
            fail_keys: vec!["media/bad-1".to_string(), "media/bad-2".to_string()],
            fail_whole_batch: false,
        });

        let job_id = Uuid::new_v4();
        let job = CleanupJobRow {
            cleanup_job_id: job_id,
            job_type: "cleanup".to_string(),
            status: "running".to_string(),
            config_json: "{}".to_string(),
            metrics_json: None,
            orphaned_files_json: None,
            execution_log_json: None,
            error_log_json: None,
            triggered_by: "api".to_string(),
            executed_by: Some("admin".to_string()),
            started_at: Some(OffsetDateTime::now_utc()),
            finished_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        metadata.create_cleanup_job(&job).await.unwrap();

        let keys: Vec<String> = (0..12)
            .map(|i| {
                if i < 2 {
                    format!("media/bad-{}", i + 1)
                } else {
                    format!("media/good-{i}")
                }
            })
            .collect();

        run_cleanup_job(job_id, keys, false, storage, metadata.clone(), 1000).await;

        let row = metadata.get_cleanup_job(job_id).await.unwrap().unwrap();
        assert_eq!(row.status, "partial");
        let metrics: CleanupMetrics =
            serde_json::from_str(row.metrics_json.as_deref().unwrap()).unwrap();
        assert_eq!(metrics.orphaned_files_found, 12);
        assert_eq!(metrics.files_deleted, 10);
        assert_eq!(metrics.deletion_errors, 2);
        assert!(row.finished_at.is_some());
        assert!(row.error_log_json.is_some());
    }

    #[tokio::test]
    async fn test_run_cleanup_job_completed_status() {
        let temp = tempdir().unwrap();
        let metadata = Arc::new(sqlite_store(&temp).await);
        let storage_backend =
            FilesystemBackend::new(temp.path().join("storage")).await.unwrap();
        storage_backend
            .put("media/orphan.pdf", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let storage: Arc<dyn ObjectStore> = Arc::new(storage_backend);

        let job_id = Uuid::new_v4();
        let job = CleanupJobRow {
            cleanup_job_id: job_id,
            job_type: "cleanup".to_string(),
            status: "running".to_string(),
            config_json: "{}".to_string(),
            metrics_json: None,
            orphaned_files_json: None,
            execution_log_json: None,
            error_log_json: None,
            triggered_by: "api".to_string(),
            executed_by: Some("admin".to_string()),
            started_at: Some(OffsetDateTime::now_utc()),
            finished_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        metadata.create_cleanup_job(&job).await.unwrap();

        run_cleanup_job(
            job_id,
            vec!["media/orphan.pdf".to_string()],
            false,
            storage,
            metadata.clone(),
            1000,
        )
        .await;

        let row = metadata.get_cleanup_job(job_id).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        let items: Vec<OrphanedFileEntry> =
            serde_json::from_str(row.orphaned_files_json.as_deref().unwrap()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, OrphanFileStatus::Deleted);
    }
}
