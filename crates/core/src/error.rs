//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("invalid storage prefix: {0}")]
    InvalidPrefix(String),

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("invalid media id: {0}")]
    InvalidMediaId(String),

    #[error("invalid upload status: {0}")]
    InvalidStatus(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
