//! Vault Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Storage, compression, and database failures are wrapped
//! as children of the kind that describes what the vault was doing.

use crate::models::{ChunkKey, VersionId};
use derive_more::{Display, Error};

/// A vault error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    #[display("storage backend error")]
    Storage,
    #[display("compression error")]
    Compression,
    /// A stored value could not be converted to its domain type.
    #[display("invalid vault data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// No chunk row exists for the key.
    #[display("chunk not found: {_0}")]
    ChunkNotFound(#[error(not(source))] ChunkKey),
    /// The blob decompressed badly or does not hash to its content hash.
    #[display("chunk corrupt: {_0}")]
    ChunkCorrupt(#[error(not(source))] ChunkKey),
    /// The blob is missing or the backend failed or timed out.
    #[display("chunk unavailable: {_0}")]
    ChunkUnavailable(#[error(not(source))] ChunkKey),
    #[display("version not found: {_0}")]
    VersionNotFound(#[error(not(source))] VersionId),
    /// A delta's base version no longer exists.
    #[display("base version {_0} is missing")]
    BaseVersionMissing(#[error(not(source))] VersionId),
    /// A patch did not parse or apply, or its result failed verification.
    #[display("failed to apply patch of version {_0}")]
    PatchApplyFailed(#[error(not(source))] VersionId),
    /// A snapshot chunk could not be read.
    #[display("content of version {_0} is missing")]
    ContentMissing(#[error(not(source))] VersionId),
    /// A delta base must be a strictly earlier version of the same file.
    #[display("version {_0} cannot be used as a delta base")]
    InvalidBase(#[error(not(source))] VersionId),
    /// The version is the base of a delta that is still stored.
    #[display("version {_0} is the base of another version")]
    BaseInUse(#[error(not(source))] VersionId),
    /// The version number is already taken for this file.
    #[display("version {_1} of file {_0} already exists")]
    VersionExists(#[error(not(source))] String, u64),
    /// Content or base content is not valid UTF-8 and cannot be diffed.
    #[display("content is not valid UTF-8 text")]
    NotText,
    #[display("upload error")]
    Upload,
    #[display("thumbnail hook failed")]
    Thumbnail,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Storage | Self::ChunkUnavailable(_) | Self::VersionExists(..))
    }

    /// Returns `true` if stored content exists on record but cannot be
    /// produced, as opposed to not existing at all.
    pub fn is_content_unavailable(&self) -> bool {
        matches!(
            self,
            Self::ContentMissing(_)
                | Self::PatchApplyFailed(_)
                | Self::BaseVersionMissing(_)
                | Self::ChunkCorrupt(_)
                | Self::ChunkNotFound(_)
                | Self::ChunkUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkId;

    #[test]
    fn test_content_unavailable_classification() {
        assert!(ErrorKind::ContentMissing(VersionId(1)).is_content_unavailable());
        assert!(ErrorKind::ChunkCorrupt(ChunkKey::Id(ChunkId(3))).is_content_unavailable());
        assert!(!ErrorKind::VersionNotFound(VersionId(1)).is_content_unavailable());
        assert!(!ErrorKind::Database.is_content_unavailable());
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::BaseInUse(VersionId(7)).to_string(), "version 7 is the base of another version");
        assert_eq!(
            ErrorKind::VersionExists("doc".to_string(), 2).to_string(),
            "version 2 of file doc already exists"
        );
    }
}
