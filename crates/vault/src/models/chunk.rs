use crate::error::{Error, ErrorKind};
use crate::models::{Chunk, ChunkId};
use cirrus_compress::Compression;
use exn::ResultExt;
use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(sqlx::FromRow)]
pub(crate) struct ChunkRow {
    pub(crate) id: i64,
    pub(crate) content_hash: String,
    pub(crate) raw_size: i64,
    pub(crate) compressed_size: i64,
    pub(crate) compression: String,
    pub(crate) storage_location: String,
    pub(crate) ref_count: i64,
    pub(crate) created_at: i64,
    pub(crate) last_referenced_at: i64,
}
impl TryFrom<ChunkRow> for Chunk {
    type Error = Error;
    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ChunkId(row.id),
            content_hash: row.content_hash,
            raw_size: u64::try_from(row.raw_size).or_raise(|| ErrorKind::InvalidData("raw size"))?,
            compressed_size: u64::try_from(row.compressed_size)
                .or_raise(|| ErrorKind::InvalidData("compressed size"))?,
            compression: row.compression.parse::<Compression>().or_raise(|| ErrorKind::InvalidData("compression"))?,
            storage_location: PathBuf::from(row.storage_location),
            ref_count: u64::try_from(row.ref_count).or_raise(|| ErrorKind::InvalidData("ref count"))?,
            created_at: OffsetDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("created at"))?,
            last_referenced_at: OffsetDateTime::from_unix_timestamp(row.last_referenced_at)
                .or_raise(|| ErrorKind::InvalidData("last referenced at"))?,
        })
    }
}

/// What remains of a chunk after its reference count was decremented.
#[derive(sqlx::FromRow)]
pub(crate) struct ReleasedChunkRow {
    pub(crate) ref_count: i64,
    pub(crate) storage_location: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ChunkRow {
        ChunkRow {
            id: 4,
            content_hash: "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08".to_string(),
            raw_size: 4,
            compressed_size: 24,
            compression: "gzip".to_string(),
            storage_location: "chunks/9f/9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08.gz"
                .to_string(),
            ref_count: 2,
            created_at: 1_700_000_000,
            last_referenced_at: 1_700_000_060,
        }
    }

    #[test]
    fn test_row_to_model() {
        let chunk = Chunk::try_from(row()).unwrap();
        assert_eq!(chunk.id, ChunkId(4));
        assert_eq!(chunk.compression, Compression::Gzip);
        assert_eq!(chunk.ref_count, 2);
        assert_eq!(chunk.last_referenced_at.unix_timestamp(), 1_700_000_060);
        assert!(chunk.storage_location.starts_with("chunks/9f"));
    }

    #[test]
    fn test_invalid_rows() {
        let negative = ChunkRow { ref_count: -1, ..row() };
        let err = Chunk::try_from(negative).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("ref count")));

        let unknown = ChunkRow { compression: "lz4".to_string(), ..row() };
        let err = Chunk::try_from(unknown).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("compression")));
    }
}
