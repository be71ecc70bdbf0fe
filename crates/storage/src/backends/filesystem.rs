//! Local filesystem storage backend.
//!
//! Intended for development and tests. Listing materializes the key set
//! under the root and paginates over the sorted order, so continuation
//! tokens behave like the S3 backend's at small scale.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    BatchDeleteOutcome, DeleteFailure, ListingPage, MAX_DELETE_BATCH, ObjectEntry, ObjectMeta,
    ObjectStore, normalize_page_size,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Get the full path for a key, with path traversal protection.
    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        // Validate all path components are normal (no .., ., root, etc.)
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }

        Ok(self.root.join(key))
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Walk the root and collect every object key matching the string
    /// prefix, sorted. S3 prefixes are string prefixes, not directories,
    /// so the walk starts at the root and filters.
    async fn collect_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // Use file_type() instead of path.is_dir() to avoid
                // following symlinks outside the storage root.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    let key = rel.to_string_lossy().to_string();
                    if key.starts_with(prefix) {
                        results.push(key);
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key)?;
        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            content_type: None,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key)?;
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key)?;
        self.ensure_parent(&path).await?;

        // Write to a uniquely named temp file, fsync, then rename for
        // atomicity under concurrent writes to the same key.
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        let temp_path = path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        );
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(backend = "filesystem", keys = keys.len()))]
    async fn delete_objects(&self, keys: &[String]) -> StorageResult<BatchDeleteOutcome> {
        if keys.len() > MAX_DELETE_BATCH {
            return Err(StorageError::BatchTooLarge {
                size: keys.len(),
                max: MAX_DELETE_BATCH,
            });
        }

        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            match self.delete(key).await {
                // Deleting a missing key counts as deleted (S3 semantics).
                Ok(()) | Err(StorageError::NotFound(_)) => outcome.deleted.push(key.clone()),
                Err(e) => outcome.failed.push(DeleteFailure {
                    key: key.clone(),
                    message: e.to_string(),
                }),
            }
        }

        Ok(outcome)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&str>,
        max_keys: usize,
    ) -> StorageResult<ListingPage> {
        let page_size = normalize_page_size(max_keys);
        let keys = self.collect_keys(prefix).await?;

        // The continuation token is the last key of the previous page;
        // resume strictly after it in the sorted order.
        let start = match token {
            Some(last_key) => keys.partition_point(|k| k.as_str() <= last_key),
            None => 0,
        };

        let mut entries = Vec::new();
        for key in keys.iter().skip(start).take(page_size) {
            let meta = match self.head(key).await {
                Ok(meta) => meta,
                // Raced with a concurrent delete; skip the vanished key.
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            entries.push(ObjectEntry {
                key: key.clone(),
                size: meta.size,
                last_modified: meta.last_modified,
            });
        }

        let next_token = if start + page_size < keys.len() {
            entries.last().map(|entry| entry.key.clone())
        } else {
            None
        };

        Ok(ListingPage {
            entries,
            next_token,
        })
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}
