//! Media object repository.

use crate::error::MetadataResult;
use crate::models::MediaObjectRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for media object records.
#[async_trait]
pub trait MediaRepo: Send + Sync {
    /// Create a media object record.
    async fn create_media_object(&self, row: &MediaObjectRow) -> MetadataResult<()>;

    /// Get a media object by ID.
    async fn get_media_object(&self, media_id: Uuid) -> MetadataResult<Option<MediaObjectRow>>;

    /// Get a media object by its storage key.
    async fn get_media_object_by_key(
        &self,
        storage_key: &str,
    ) -> MetadataResult<Option<MediaObjectRow>>;

    /// Update a media object's upload status.
    async fn update_upload_status(
        &self,
        media_id: Uuid,
        status: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// List media objects in creation order, paged. Used by the scanner to
    /// materialize the valid-key set.
    async fn list_media_objects(
        &self,
        limit: u32,
        offset: u64,
    ) -> MetadataResult<Vec<MediaObjectRow>>;

    /// Count all media object records.
    async fn count_media_objects(&self) -> MetadataResult<u64>;

    /// Flip staging rows created before `cutoff` to orphaned. Returns the
    /// number of rows marked.
    async fn mark_stale_staging(
        &self,
        cutoff: OffsetDateTime,
        marked_at: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Remove the record for a deleted storage object. Returns the number
    /// of rows removed (0 when the key was untracked).
    async fn delete_media_object_by_key(&self, storage_key: &str) -> MetadataResult<u64>;
}
