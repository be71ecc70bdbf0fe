//! Media object identity and lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a media object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaId(Uuid);

impl MediaId {
    /// Generate a new random media ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidMediaId(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MediaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MediaId({})", self.0)
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a media object's bytes in storage.
///
/// A row is created as `Staging` when the upload lands, becomes `Confirmed`
/// when the owning submission is finalized, ages to `Orphaned` when a scan
/// finds it unconfirmed past the retention window, and is removed from the
/// store entirely once cleanup deletes the object (`Deleted` exists for
/// rows that are tombstoned rather than removed).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Staging,
    Confirmed,
    Orphaned,
    Deleted,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Confirmed => "confirmed",
            Self::Orphaned => "orphaned",
            Self::Deleted => "deleted",
        }
    }

    /// Parse from the stored string form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "staging" => Ok(Self::Staging),
            "confirmed" => Ok(Self::Confirmed),
            "orphaned" => Ok(Self::Orphaned),
            "deleted" => Ok(Self::Deleted),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }

    /// Whether the bytes are still referenced by a live record.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Staging | Self::Confirmed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Submission states that no longer protect their referenced media.
///
/// The metadata store denormalizes the owning submission's state onto the
/// media row; anything not listed here counts as non-terminal and blocks
/// forced deletion of a confirmed object.
const TERMINAL_SUBMISSION_STATES: [&str; 3] = ["completed", "rejected", "withdrawn"];

/// Whether a submission state string is terminal.
pub fn is_submission_terminal(state: &str) -> bool {
    TERMINAL_SUBMISSION_STATES.contains(&state)
}
