//! Batch upload processing.
//!
//! Drives an ordered file set through fixed-size batches. Batches always run
//! strictly in sequence, which bounds load on the backing store; files within
//! one batch run sequentially or concurrently depending on configuration.
//! Each file gets its own retry loop with classified errors and bounded
//! backoff; a per-file timeout is enforced by racing the upload against a
//! timer and counts as a retryable transport failure.

use crate::classify::UploadError;
use crate::media::MediaId;
use crate::retry::RetryPolicy;
use crate::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Whether files within one batch are uploaded one at a time or together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchConcurrency {
    /// One file at a time within a batch.
    Sequential,
    /// All files of a batch concurrently; batches still run in sequence.
    Parallel,
}

/// Options controlling a batch upload run.
#[derive(Clone, Debug)]
pub struct BatchUploadOptions {
    /// Number of files per batch, clamped to [1, MAX_BATCH_SIZE].
    pub batch_size: usize,
    /// Concurrency mode within a batch.
    pub concurrency: BatchConcurrency,
    /// Retries after the first attempt; a file gets `max_retries + 1` attempts.
    pub max_retries: u32,
    /// Upper bound on a single upload attempt.
    pub per_file_timeout: Duration,
    /// Backoff policy between attempts.
    pub retry: RetryPolicy,
}

impl Default for BatchUploadOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: BatchConcurrency::Sequential,
            max_retries: 2,
            per_file_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// One file of an upload run.
#[derive(Clone, Debug)]
pub struct UploadFile {
    /// Position in the submitted file set (0-based).
    pub index: usize,
    /// Client-supplied filename.
    pub name: String,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// File contents.
    pub content: Bytes,
}

impl UploadFile {
    pub fn new(index: usize, name: impl Into<String>, content: Bytes) -> Self {
        let name = name.into();
        Self {
            index,
            name,
            size_bytes: content.len() as u64,
            content,
        }
    }
}

/// What the upload function hands back for a stored file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Metadata row ID assigned to the stored object.
    pub media_id: MediaId,
    /// Storage key the bytes landed under.
    pub storage_key: String,
    /// Public access URL, when the backend exposes one.
    pub url: Option<String>,
}

/// Per-file task state, owned by a single run and discarded afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadTaskStatus {
    Pending,
    Uploading,
    Retrying,
    Succeeded,
    Failed,
}

impl UploadTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Tracking record for one file within a run.
#[derive(Clone, Debug)]
pub struct UploadTask {
    pub index: usize,
    pub name: String,
    pub size_bytes: u64,
    pub status: UploadTaskStatus,
    pub attempts: u32,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

impl UploadTask {
    fn new(file: &UploadFile) -> Self {
        Self {
            index: file.index,
            name: file.name.clone(),
            size_bytes: file.size_bytes,
            status: UploadTaskStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Progress snapshot emitted after file transitions and batch boundaries.
#[derive(Clone, Debug, Serialize)]
pub struct BatchUploadProgress {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
    /// Current batch (1-based).
    pub current_batch: usize,
    pub total_batches: usize,
    /// File the snapshot was emitted for, if any.
    pub current_file: Option<String>,
    /// Completion percentage over the whole file set.
    pub percent: f64,
    /// Remaining time estimate, extrapolated from elapsed / processed.
    pub eta_seconds: Option<f64>,
}

/// A successfully uploaded file.
#[derive(Clone, Debug, Serialize)]
pub struct UploadedFile {
    pub index: usize,
    pub name: String,
    pub media_id: MediaId,
    pub storage_key: String,
    pub url: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// A permanently failed file. Appended to the run result, never mutated.
#[derive(Clone, Debug, Serialize)]
pub struct BatchUploadError {
    pub index: usize,
    pub name: String,
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// Result of a whole batch run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchUploadResult {
    /// True iff no file failed.
    pub success: bool,
    pub successful: Vec<UploadedFile>,
    pub failed: Vec<BatchUploadError>,
}

impl BatchUploadResult {
    pub fn processed(&self) -> usize {
        self.successful.len() + self.failed.len()
    }
}

/// Sink for upload lifecycle events. The production implementation feeds
/// Prometheus counters; tests can capture events.
pub trait MetricsSink: Send + Sync {
    fn upload_started(&self, _name: &str) {}
    fn upload_retried(&self, _name: &str, _attempt: u32) {}
    fn upload_succeeded(&self, _name: &str, _duration: Duration) {}
    fn upload_failed(&self, _name: &str, _retryable: bool) {}
}

/// Metrics sink that drops every event.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

type ProgressFn = dyn Fn(&BatchUploadProgress) + Send + Sync;

/// Shared per-run counters. Files within a parallel batch only touch their
/// own task record; these atomics are the sole shared state.
struct RunCounters {
    processed: AtomicUsize,
    successful: AtomicUsize,
    failed: AtomicUsize,
}

struct RunContext {
    counters: RunCounters,
    total: usize,
    total_batches: usize,
    started: Instant,
}

/// Drives a file set through batches, applying retry, classification,
/// timeout, progress reporting, and metrics emission.
pub struct BatchUploadProcessor {
    options: BatchUploadOptions,
    metrics: Arc<dyn MetricsSink>,
    on_progress: Option<Box<ProgressFn>>,
}

/// Terminal outcome for one file.
enum FileOutcome {
    Succeeded(UploadedFile),
    Failed(BatchUploadError),
}

impl BatchUploadProcessor {
    pub fn new(options: BatchUploadOptions) -> Self {
        Self {
            options,
            metrics: Arc::new(NoopMetrics),
            on_progress: None,
        }
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attach a progress callback.
    pub fn with_progress(
        mut self,
        callback: impl Fn(&BatchUploadProgress) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Run the file set through the injected upload function.
    ///
    /// Returns `Err` only for fatal (programming) errors; transport and
    /// validation failures are recorded per-file in the result.
    pub async fn run<F, Fut>(
        &self,
        files: Vec<UploadFile>,
        upload: F,
    ) -> Result<BatchUploadResult, UploadError>
    where
        F: Fn(UploadFile) -> Fut + Sync,
        Fut: Future<Output = Result<UploadReceipt, UploadError>> + Send,
    {
        let total = files.len();
        if total == 0 {
            return Ok(BatchUploadResult {
                success: true,
                ..Default::default()
            });
        }

        let batch_size = self.options.batch_size.clamp(1, MAX_BATCH_SIZE);
        let ctx = RunContext {
            counters: RunCounters {
                processed: AtomicUsize::new(0),
                successful: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            },
            total,
            total_batches: total.div_ceil(batch_size),
            started: Instant::now(),
        };

        let mut result = BatchUploadResult::default();
        let mut files = files.into_iter();
        for batch_index in 1..=ctx.total_batches {
            let batch: Vec<UploadFile> = files.by_ref().take(batch_size).collect();
            tracing::debug!(
                batch = batch_index,
                total_batches = ctx.total_batches,
                files = batch.len(),
                "starting upload batch"
            );

            match self.options.concurrency {
                BatchConcurrency::Sequential => {
                    for file in batch {
                        let outcome = self.process_file(file, &upload, &ctx, batch_index).await?;
                        record_outcome(&mut result, outcome);
                    }
                }
                BatchConcurrency::Parallel => {
                    let futures: Vec<_> = batch
                        .into_iter()
                        .map(|file| self.process_file(file, &upload, &ctx, batch_index))
                        .collect();
                    for outcome in join_all(futures).await {
                        record_outcome(&mut result, outcome?);
                    }
                }
            }

            self.emit_progress(&ctx, batch_index, None);
        }

        result.success = result.failed.is_empty();
        Ok(result)
    }

    /// Retry loop for a single file. Owns its task record exclusively; the
    /// only shared state it touches is the atomic run counters.
    async fn process_file<F, Fut>(
        &self,
        file: UploadFile,
        upload: &F,
        ctx: &RunContext,
        batch_index: usize,
    ) -> Result<FileOutcome, UploadError>
    where
        F: Fn(UploadFile) -> Fut + Sync,
        Fut: Future<Output = Result<UploadReceipt, UploadError>> + Send,
    {
        let mut task = UploadTask::new(&file);
        task.status = UploadTaskStatus::Uploading;
        task.started_at = Some(OffsetDateTime::now_utc());
        let start = Instant::now();
        let max_attempts = self.options.max_retries.saturating_add(1);

        self.metrics.upload_started(&file.name);
        self.emit_progress(ctx, batch_index, Some(&file.name));

        loop {
            task.attempts += 1;
            let attempt = task.attempts;

            let attempt_result =
                match tokio::time::timeout(self.options.per_file_timeout, upload(file.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(UploadError::Timeout(self.options.per_file_timeout)),
                };

            match attempt_result {
                Ok(receipt) => {
                    task.status = UploadTaskStatus::Succeeded;
                    task.finished_at = Some(OffsetDateTime::now_utc());
                    ctx.counters.successful.fetch_add(1, Ordering::Relaxed);
                    ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
                    let duration = start.elapsed();
                    self.metrics.upload_succeeded(&file.name, duration);
                    self.emit_progress(ctx, batch_index, Some(&file.name));
                    return Ok(FileOutcome::Succeeded(UploadedFile {
                        index: task.index,
                        name: task.name,
                        media_id: receipt.media_id,
                        storage_key: receipt.storage_key,
                        url: receipt.url,
                        attempts: attempt,
                        duration_ms: duration.as_millis() as u64,
                    }));
                }
                Err(err) if err.is_fatal() => {
                    // A programming error, not a transport failure: abort
                    // the run instead of recording it against the file.
                    return Err(err);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    tracing::warn!(
                        file = %file.name,
                        attempt,
                        class = %err.class(),
                        error = %err,
                        "upload attempt failed"
                    );

                    if retryable && attempt < max_attempts {
                        task.status = UploadTaskStatus::Retrying;
                        self.metrics.upload_retried(&file.name, attempt);
                        self.emit_progress(ctx, batch_index, Some(&file.name));
                        tokio::time::sleep(self.options.retry.delay_for_attempt(attempt)).await;
                        task.status = UploadTaskStatus::Uploading;
                        continue;
                    }

                    task.status = UploadTaskStatus::Failed;
                    task.finished_at = Some(OffsetDateTime::now_utc());
                    ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                    ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
                    self.metrics.upload_failed(&file.name, retryable);
                    self.emit_progress(ctx, batch_index, Some(&file.name));
                    return Ok(FileOutcome::Failed(BatchUploadError {
                        index: task.index,
                        name: task.name,
                        message: err.to_string(),
                        retryable,
                        attempts: attempt,
                        occurred_at: OffsetDateTime::now_utc(),
                    }));
                }
            }
        }
    }

    fn emit_progress(&self, ctx: &RunContext, current_batch: usize, current_file: Option<&str>) {
        let Some(callback) = &self.on_progress else {
            return;
        };

        let processed = ctx.counters.processed.load(Ordering::Relaxed);
        let successful = ctx.counters.successful.load(Ordering::Relaxed);
        let failed = ctx.counters.failed.load(Ordering::Relaxed);
        let percent = (processed as f64 / ctx.total as f64) * 100.0;
        let eta_seconds = if processed > 0 && processed < ctx.total {
            let elapsed = ctx.started.elapsed().as_secs_f64();
            Some(elapsed / processed as f64 * (ctx.total - processed) as f64)
        } else {
            None
        };

        callback(&BatchUploadProgress {
            processed,
            successful,
            failed,
            total: ctx.total,
            current_batch,
            total_batches: ctx.total_batches,
            current_file: current_file.map(str::to_string),
            percent,
            eta_seconds,
        });
    }
}

fn record_outcome(result: &mut BatchUploadResult, outcome: FileOutcome) {
    match outcome {
        FileOutcome::Succeeded(file) => result.successful.push(file),
        FileOutcome::Failed(error) => result.failed.push(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    fn sample_files(count: usize) -> Vec<UploadFile> {
        (0..count)
            .map(|i| UploadFile::new(i, format!("file-{i}.bin"), Bytes::from(vec![0u8; 16])))
            .collect()
    }

    fn fast_options(batch_size: usize, max_retries: u32) -> BatchUploadOptions {
        BatchUploadOptions {
            batch_size,
            concurrency: BatchConcurrency::Sequential,
            max_retries,
            per_file_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                jitter: false,
            },
        }
    }

    fn ok_receipt(file: &UploadFile) -> UploadReceipt {
        UploadReceipt {
            media_id: MediaId::new(),
            storage_key: format!("media/{}", file.name),
            url: None,
        }
    }

    #[tokio::test]
    async fn test_all_success_batches() {
        let progress: Arc<Mutex<Vec<BatchUploadProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let progress_clone = progress.clone();
        let processor = BatchUploadProcessor::new(fast_options(2, 2))
            .with_progress(move |p| progress_clone.lock().unwrap().push(p.clone()));

        let result = processor
            .run(sample_files(5), |file| async move { Ok(ok_receipt(&file)) })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.successful.len(), 5);
        assert!(result.failed.is_empty());
        assert!(result.successful.iter().all(|f| f.attempts == 1));

        // 5 files at batch size 2 means ceil(5/2) = 3 batches.
        let snapshots = progress.lock().unwrap();
        assert_eq!(snapshots.iter().map(|p| p.current_batch).max(), Some(3));
        assert!(snapshots.iter().all(|p| p.total_batches == 3));
        let last = snapshots.last().unwrap();
        assert_eq!(last.processed, 5);
        assert_eq!(last.successful, 5);
        assert!((last.percent - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_non_retryable_attempted_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let processor = BatchUploadProcessor::new(fast_options(2, 3));

        let result = processor
            .run(sample_files(1), move |_file| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Err(UploadError::Validation("bad payload".into()))
                }
            })
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].attempts, 1);
        assert!(!result.failed[0].retryable);
    }

    #[tokio::test]
    async fn test_retryable_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let processor = BatchUploadProcessor::new(fast_options(2, 2));

        let result = processor
            .run(sample_files(1), move |_file| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Err(UploadError::Network("connection reset".into()))
                }
            })
            .await
            .unwrap();

        // max_retries = 2 allows 3 attempts in total.
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].attempts, 3);
        assert!(result.failed[0].retryable);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let processor = BatchUploadProcessor::new(fast_options(2, 3));

        let result = processor
            .run(sample_files(1), move |file| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                        Err(UploadError::Server("503".into()))
                    } else {
                        Ok(ok_receipt(&file))
                    }
                }
            })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.successful.len(), 1);
        assert_eq!(result.successful[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let options = BatchUploadOptions {
            per_file_timeout: Duration::from_millis(10),
            ..fast_options(2, 1)
        };
        let processor = BatchUploadProcessor::new(options);

        let result = processor
            .run(sample_files(1), |file| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(ok_receipt(&file))
            })
            .await
            .unwrap();

        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].retryable);
        assert_eq!(result.failed[0].attempts, 2);
        assert!(result.failed[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_fatal_error_propagates() {
        let processor = BatchUploadProcessor::new(fast_options(2, 3));

        let outcome = processor
            .run(sample_files(2), |_file| async move {
                Err(UploadError::Fatal("broken invariant".into()))
            })
            .await;

        assert!(matches!(outcome, Err(UploadError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_parallel_batch_all_success() {
        let options = BatchUploadOptions {
            concurrency: BatchConcurrency::Parallel,
            ..fast_options(3, 0)
        };
        let processor = BatchUploadProcessor::new(options);

        let result = processor
            .run(sample_files(7), |file| async move { Ok(ok_receipt(&file)) })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.successful.len(), 7);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_files() {
        let processor = BatchUploadProcessor::new(fast_options(2, 0));

        let result = processor
            .run(sample_files(4), |file| async move {
                if file.index == 2 {
                    Err(UploadError::Validation("rejected".into()))
                } else {
                    Ok(ok_receipt(&file))
                }
            })
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.successful.len(), 3);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].index, 2);
    }

    #[tokio::test]
    async fn test_empty_file_set() {
        let processor = BatchUploadProcessor::new(fast_options(2, 0));
        let result = processor
            .run(Vec::new(), |file| async move { Ok(ok_receipt(&file)) })
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.processed(), 0);
    }
}
