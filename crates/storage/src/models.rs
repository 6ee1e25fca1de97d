//! Storage models.

use std::path::PathBuf;
use time::OffsetDateTime;

/// Blob metadata returned by storage backends.
///
/// Used by listing operations (orphan sweeps) and by `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Relative key from storage root
    pub path: PathBuf,
    /// Blob size in bytes, as stored (compressed)
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
}
impl BlobInfo {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
        }
    }
}
