//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Page size constraints for listing operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MIN_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Maximum number of keys in a single batch delete call
/// (the S3 DeleteObjects limit).
pub const MAX_DELETE_BATCH: usize = 1000;

/// Clamp a requested page size to the supported range.
pub fn normalize_page_size(page_size: usize) -> usize {
    page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

/// A single object returned by a listing page.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    /// Object key, relative to the backend's configured prefix.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if the backend reports one).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// A single page of listing results.
///
/// `next_token` is an opaque, backend-specific continuation token; if None,
/// this is the last page. Tokens are only meaningful for the prefix they
/// were produced for.
#[derive(Clone, Debug)]
pub struct ListingPage {
    pub entries: Vec<ObjectEntry>,
    pub next_token: Option<String>,
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}

/// A key that could not be deleted in a batch delete call.
#[derive(Clone, Debug)]
pub struct DeleteFailure {
    pub key: String,
    pub message: String,
}

/// Per-key outcome of a batch delete call.
#[derive(Clone, Debug, Default)]
pub struct BatchDeleteOutcome {
    /// Keys confirmed deleted (deleting a missing key counts as deleted,
    /// matching S3 semantics).
    pub deleted: Vec<String>,
    /// Keys the backend reported an error for.
    pub failed: Vec<DeleteFailure>,
}

/// Object store abstraction over S3-compatible backends.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete a single object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Delete up to [`MAX_DELETE_BATCH`] objects in one backend call,
    /// reporting a per-key outcome. A larger batch is rejected outright.
    async fn delete_objects(&self, keys: &[String]) -> StorageResult<BatchDeleteOutcome>;

    /// List one page of objects under a prefix.
    ///
    /// `token` resumes from a previous page's `next_token`; `max_keys` is
    /// clamped to the supported range. Follows S3 `ListObjectsV2`
    /// continuation semantics.
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
        max_keys: usize,
    ) -> StorageResult<ListingPage>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3",
    /// "filesystem"). Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called during server startup to ensure the storage is available
    /// before accepting requests. The default implementation returns Ok(()),
    /// suitable for backends that don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_page_size() {
        assert_eq!(normalize_page_size(0), MIN_PAGE_SIZE);
        assert_eq!(normalize_page_size(500), 500);
        assert_eq!(normalize_page_size(50_000), MAX_PAGE_SIZE);
    }
}
