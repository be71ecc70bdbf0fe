//! Configuration types shared across crates.

use crate::batch::{BatchConcurrency, BatchUploadOptions};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// SECURITY: When enabled, ensure this endpoint is network-restricted
    /// to authorized Prometheus scraper IPs only at the infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Admin token configuration.
///
/// The admin token gates every cleanup endpoint. Only its SHA-256 hash is
/// held in configuration; the raw token never touches disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Pre-computed hash of the admin token (SHA256 hex, 64 characters).
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
}

impl AdminConfig {
    /// Create a test configuration with a dummy token hash.
    ///
    /// **For testing only.** The hash is deterministic but not a real token.
    pub fn for_testing() -> Self {
        Self {
            // SHA256 of "test-admin-token"
            token_hash: "9f735e0df9a1ddc702bf0a1a7b83033f9f7153a00c29de82cedadc9957289b05"
                .to_string(),
        }
    }

    /// Validate admin configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.token_hash.len() != 64 || !self.token_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("admin.token_hash must be a 64-character SHA256 hex digest".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO
        /// and some S3-compatible services; AWS S3 wants virtual-hosted style.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (recommended for testing and small deployments only).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer DEPOT_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds (prevents hung queries).
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300_000) // 5 minutes
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Upload pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Files per batch. Batches always run in sequence.
    #[serde(default = "default_upload_batch_size")]
    pub batch_size: usize,
    /// Upload files within one batch concurrently instead of one at a time.
    #[serde(default)]
    pub parallel_within_batch: bool,
    /// Retries after the first attempt; each file gets `max_retries + 1` attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-file upload timeout in seconds.
    #[serde(default = "default_per_file_timeout_secs")]
    pub per_file_timeout_secs: u64,
    /// Base retry delay in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Randomize retry delays.
    #[serde(default)]
    pub retry_jitter: bool,
    /// Maximum size of a single file in bytes.
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    /// Maximum number of files in one upload request.
    #[serde(default = "default_max_files_per_request")]
    pub max_files_per_request: usize,
}

fn default_upload_batch_size() -> usize {
    crate::DEFAULT_BATCH_SIZE
}

fn default_max_retries() -> u32 {
    2
}

fn default_per_file_timeout_secs() -> u64 {
    120
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_max_file_size_bytes() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_max_files_per_request() -> usize {
    20
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: default_upload_batch_size(),
            parallel_within_batch: false,
            max_retries: default_max_retries(),
            per_file_timeout_secs: default_per_file_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: false,
            max_file_size_bytes: default_max_file_size_bytes(),
            max_files_per_request: default_max_files_per_request(),
        }
    }
}

impl UploadConfig {
    /// Build batch processor options from this configuration.
    pub fn batch_options(&self) -> BatchUploadOptions {
        BatchUploadOptions {
            batch_size: self.batch_size.clamp(1, crate::MAX_BATCH_SIZE),
            concurrency: if self.parallel_within_batch {
                BatchConcurrency::Parallel
            } else {
                BatchConcurrency::Sequential
            },
            max_retries: self.max_retries,
            per_file_timeout: Duration::from_secs(self.per_file_timeout_secs),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                jitter: self.retry_jitter,
            },
        }
    }

    /// Validate upload configuration for dangerous settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("upload.batch_size cannot be 0".to_string());
        }
        if self.per_file_timeout_secs == 0 {
            return Err("upload.per_file_timeout_secs cannot be 0".to_string());
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(format!(
                "upload.retry_max_delay_ms {} is below retry_base_delay_ms {}",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            ));
        }
        Ok(())
    }
}

/// Cleanup and reconciliation configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Minimum object age in days before it is eligible for orphan
    /// reclamation. Protects uploads still being reconciled.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Storage prefixes a scan may touch. Scan requests naming any other
    /// prefix are rejected outright.
    #[serde(default = "default_allowed_prefixes")]
    pub allowed_prefixes: Vec<String>,
    /// Ceiling on objects examined by a single scan. Large namespaces are
    /// swept incrementally across re-runs.
    #[serde(default = "default_max_files_to_process")]
    pub max_files_to_process: u64,
    /// Keys per storage delete call (the S3 DeleteObjects limit is 1000).
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
    /// Substring patterns exempting matching keys from orphan candidacy.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

fn default_retention_days() -> u32 {
    30
}

fn default_allowed_prefixes() -> Vec<String> {
    vec!["media/".to_string()]
}

fn default_max_files_to_process() -> u64 {
    100_000
}

fn default_delete_batch_size() -> usize {
    1000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            allowed_prefixes: default_allowed_prefixes(),
            max_files_to_process: default_max_files_to_process(),
            delete_batch_size: default_delete_batch_size(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl CleanupConfig {
    /// Get the retention window as a Duration.
    pub fn retention_window(&self) -> time::Duration {
        time::Duration::days(i64::from(self.retention_days))
    }

    /// Validate cleanup configuration for dangerous settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.retention_days == 0 {
            return Err(
                "cleanup.retention_days cannot be 0: a zero retention window would \
                 reclaim objects belonging to in-flight uploads"
                    .to_string(),
            );
        }
        if self.allowed_prefixes.is_empty() {
            return Err("cleanup.allowed_prefixes cannot be empty".to_string());
        }
        for prefix in &self.allowed_prefixes {
            if prefix.is_empty() || prefix.contains("..") || prefix.starts_with('/') {
                return Err(format!("cleanup.allowed_prefixes entry is unsafe: {prefix:?}"));
            }
        }
        if self.delete_batch_size == 0 || self.delete_batch_size > 1000 {
            return Err(format!(
                "cleanup.delete_batch_size {} must be within 1..=1000",
                self.delete_batch_size
            ));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Admin token configuration (required).
    pub admin: AdminConfig,
    /// Upload pipeline configuration.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Cleanup and reconciliation configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage, SQLite metadata,
    /// and a dummy admin token.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            admin: AdminConfig::for_testing(),
            upload: UploadConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }

    /// Validate the whole configuration, failing on the first problem.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.admin.validate()?;
        self.upload.validate()?;
        self.cleanup.validate()?;
        Ok(())
    }
}
