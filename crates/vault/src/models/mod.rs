//! Domain types and their database row counterparts.

mod chunk;
mod version;

pub(crate) use self::chunk::{ChunkRow, ReleasedChunkRow};
pub(crate) use self::version::VersionRow;
use cirrus_compress::Compression;
use derive_more::Display;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Identifier of a stored [`FileVersion`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct VersionId(pub i64);

/// Identifier of a stored [`Chunk`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct ChunkId(pub i64);

/// Lookup key for [`read_chunk`](crate::ChunkStore::read_chunk).
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ChunkKey {
    #[display("#{_0}")]
    Id(ChunkId),
    #[display("{_0}")]
    Hash(String),
}
impl From<ChunkId> for ChunkKey {
    fn from(id: ChunkId) -> Self {
        Self::Id(id)
    }
}

/// A content-addressed chunk as recorded in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    /// Lowercase hex SHA-256 of the uncompressed bytes.
    pub content_hash: String,
    pub raw_size: u64,
    pub compressed_size: u64,
    pub compression: Compression,
    /// Blob key relative to the storage root.
    pub storage_location: PathBuf,
    pub ref_count: u64,
    pub created_at: OffsetDateTime,
    pub last_referenced_at: OffsetDateTime,
}

/// Handle returned by [`ensure_chunk`](crate::ChunkStore::ensure_chunk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub id: ChunkId,
    pub content_hash: String,
    pub raw_size: u64,
    pub compressed_size: u64,
    /// `true` when an existing chunk was reused instead of written.
    pub deduplicated: bool,
}
impl ChunkRef {
    pub(crate) fn reused(chunk: Chunk) -> Self {
        Self {
            id: chunk.id,
            content_hash: chunk.content_hash,
            raw_size: chunk.raw_size,
            compressed_size: chunk.compressed_size,
            deduplicated: true,
        }
    }
}

/// How a version's content is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Representation {
    /// Full content as an ordered list of chunks.
    Snapshot { chunks: Vec<ChunkId> },
    /// A textual patch against an earlier version of the same file.
    Delta {
        base_version_id: VersionId,
        strategy: String,
        patch: String,
        patch_size: u64,
    },
}

/// One immutable point in a file's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    pub id: VersionId,
    pub file_id: String,
    pub version_number: u64,
    /// Lowercase hex SHA-256 of the full content.
    pub content_hash: String,
    pub size: u64,
    pub mime: String,
    pub original_name: String,
    /// Opaque encryption IV passed through from the upload pipeline.
    pub iv: Option<String>,
    pub created_at: OffsetDateTime,
    pub representation: Representation,
}
impl FileVersion {
    pub fn is_snapshot(&self) -> bool {
        matches!(self.representation, Representation::Snapshot { .. })
    }

    pub fn base_version_id(&self) -> Option<VersionId> {
        match &self.representation {
            Representation::Snapshot { .. } => None,
            Representation::Delta { base_version_id, .. } => Some(*base_version_id),
        }
    }
}

/// Input to [`decide_and_save_version`](crate::VersionStore::decide_and_save_version).
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub file_id: String,
    pub version_number: u64,
    pub buffer: Vec<u8>,
    pub mime: String,
    pub original_name: String,
    pub iv: Option<String>,
}
impl NewVersion {
    pub fn new(file_id: impl Into<String>, version_number: u64, buffer: impl Into<Vec<u8>>) -> Self {
        let file_id = file_id.into();
        Self {
            original_name: file_id.clone(),
            file_id,
            version_number,
            buffer: buffer.into(),
            mime: "application/octet-stream".to_string(),
            iv: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = name.into();
        self
    }

    pub fn with_iv(mut self, iv: impl Into<String>) -> Self {
        self.iv = Some(iv.into());
        self
    }
}
