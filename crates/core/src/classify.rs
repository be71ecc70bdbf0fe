//! Upload failure classification.
//!
//! Every failure from the injected upload function is mapped onto a small
//! taxonomy that decides retryability: validation and client errors fail a
//! file immediately, transport-shaped errors (network, server, timeout) are
//! retried with bounded backoff, and anything unrecognized is treated as
//! transient. Fatal errors are programming errors and abort the whole run.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure category for a single upload attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unsafe input (wrong size, bad name, rejected payload).
    Validation,
    /// Connection-level transport failure.
    Network,
    /// Backing store returned a server-side error.
    Server,
    /// The attempt exceeded the per-file timeout.
    Timeout,
    /// Unrecognized failure, treated as transient.
    Unknown,
}

impl ErrorClass {
    /// Whether a failure of this class should be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Server => "server",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned by an upload function for a single file attempt.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("upload failed: {0}")]
    Other(String),

    /// A programming error, not a transport failure. Never retried;
    /// propagates out of the batch run instead of being recorded per-file.
    #[error("fatal upload error: {0}")]
    Fatal(String),
}

impl UploadError {
    /// Classify this error for the retry decision.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Validation,
            Self::Network(_) => ErrorClass::Network,
            Self::Server(_) => ErrorClass::Server,
            Self::Timeout(_) => ErrorClass::Timeout,
            Self::Other(_) | Self::Fatal(_) => ErrorClass::Unknown,
        }
    }

    /// Whether this error should be retried by the per-file retry loop.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && self.class().is_retryable()
    }

    /// Whether this error aborts the whole batch run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
