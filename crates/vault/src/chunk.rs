//! Content-addressed chunk storage.
//!
//! Buffers are cut into fixed-size chunks. Each unique chunk (by SHA-256 of
//! its uncompressed bytes) is compressed and written to the storage backend
//! exactly once, and a row in `chunks` counts how many version references
//! point at it. All reference count changes are single conditional SQL
//! statements; nothing here reads a count and writes it back.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{Chunk, ChunkId, ChunkKey, ChunkRef, ChunkRow, ReleasedChunkRow};
use cirrus_compress::Compression;
use cirrus_storage::error::ErrorKind as StorageErrorKind;
use cirrus_storage::{BackendHandle, shard_path};
use exn::{OptionExt, ResultExt};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::Path;
use std::slice::Chunks;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;
/// Default age before an unreferenced chunk may be reclaimed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60 * 60);
/// Key prefix under which all chunk blobs live.
pub const CHUNK_PREFIX: &str = "chunks";
/// Bound on the lookup/insert loop in `ensure_chunk` under contention.
const MAX_ENSURE_ATTEMPTS: usize = 8;

/// Split a buffer into fixed-size, non-overlapping windows.
///
/// The final window may be shorter. An empty buffer yields nothing. A chunk
/// size of zero is treated as one.
///
/// ```
/// use cirrus_vault::chunk_buffer;
///
/// let chunks: Vec<&[u8]> = chunk_buffer(b"abcdefg", 3).collect();
/// assert_eq!(chunks, [&b"abc"[..], b"def", b"g"]);
/// assert_eq!(chunk_buffer(b"", 3).count(), 0);
/// ```
pub fn chunk_buffer(buffer: &[u8], chunk_size: usize) -> Chunks<'_, u8> {
    buffer.chunks(chunk_size.max(1))
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Reference-counted, deduplicating chunk store.
#[derive(Clone)]
pub struct ChunkStore {
    pool: SqlitePool,
    backend: BackendHandle,
    compression: Compression,
    grace_period: Duration,
}

impl ChunkStore {
    pub fn new(db: &Database, backend: BackendHandle) -> Self {
        Self {
            pool: db.pool().clone(),
            backend,
            compression: Compression::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Format used for newly written chunks. Existing chunks keep theirs.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Look up a chunk row.
    pub async fn get_chunk(&self, key: &ChunkKey) -> Result<Option<Chunk>> {
        let row: Option<ChunkRow> = match key {
            ChunkKey::Id(id) => sqlx::query_as(include_str!("../queries/get_chunk_by_id.sql"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await,
            ChunkKey::Hash(hash) => sqlx::query_as(include_str!("../queries/get_chunk_by_hash.sql"))
                .bind(hash)
                .fetch_optional(&self.pool)
                .await,
        }
        .or_raise(|| ErrorKind::Database)?;
        row.map(Chunk::try_from).transpose()
    }

    /// Store `bytes` as a chunk, or take another reference on the existing
    /// chunk with the same content.
    ///
    /// A row whose blob has gone missing is purged and the chunk written
    /// again. A row at zero references is being reclaimed and is replaced
    /// rather than revived.
    #[instrument(level = "debug", skip_all, fields(size = bytes.len(), hash))]
    pub async fn ensure_chunk(&self, bytes: &[u8]) -> Result<ChunkRef> {
        let hash = content_hash(bytes);
        tracing::Span::current().record("hash", hash.as_str());
        for attempt in 1..=MAX_ENSURE_ATTEMPTS {
            if let Some(chunk) = self.get_chunk(&ChunkKey::Hash(hash.clone())).await? {
                if chunk.ref_count > 0 {
                    let present = self.backend.exists(&chunk.storage_location).await.or_raise(|| ErrorKind::Storage)?;
                    if present {
                        if self.increment(chunk.id).await? {
                            tracing::trace!(chunk_id = %chunk.id, "Reusing existing chunk");
                            return Ok(ChunkRef::reused(chunk));
                        }
                        // Dropped to zero between lookup and increment.
                        continue;
                    }
                    tracing::warn!(
                        chunk_id = %chunk.id,
                        location = %chunk.storage_location.display(),
                        "Chunk blob is missing; purging stale row and rewriting chunk"
                    );
                    sqlx::query(include_str!("../queries/delete_chunk.sql"))
                        .bind(chunk.id.0)
                        .execute(&self.pool)
                        .await
                        .or_raise(|| ErrorKind::Database)?;
                } else {
                    sqlx::query(include_str!("../queries/delete_zero_ref_chunk.sql"))
                        .bind(chunk.id.0)
                        .execute(&self.pool)
                        .await
                        .or_raise(|| ErrorKind::Database)?;
                }
            }
            if let Some(created) = self.create(bytes, &hash).await? {
                return Ok(created);
            }
            tracing::debug!(attempt, "Lost chunk insert race, retrying as dedup");
        }
        exn::bail!(ErrorKind::Database)
    }

    async fn increment(&self, id: ChunkId) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/increment_chunk.sql"))
            .bind(now())
            .bind(id.0)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() == 1)
    }

    /// Compress and write the blob, then insert the row. Returns `None` when
    /// another writer inserted the same hash first.
    ///
    /// Every row gets its own blob key, so deleting the blob of a reclaimed
    /// row can never remove the blob of a newer row for the same content.
    async fn create(&self, bytes: &[u8], hash: &str) -> Result<Option<ChunkRef>> {
        let compression = self.compression;
        let suffix = format!("-{}{}", Uuid::new_v4().simple(), compression.extension());
        let location = shard_path(CHUNK_PREFIX, hash, &suffix).or_raise(|| ErrorKind::Storage)?;
        let location_str = location.to_str().ok_or_raise(|| ErrorKind::InvalidData("storage location"))?.to_string();
        let raw = bytes.to_vec();
        let compressed = tokio::task::spawn_blocking(move || compression.compress(&raw))
            .await
            .or_raise(|| ErrorKind::Compression)?
            .or_raise(|| ErrorKind::Compression)?;
        self.backend.write(&location, &compressed).await.or_raise(|| ErrorKind::Storage)?;

        let raw_size = i64::try_from(bytes.len()).or_raise(|| ErrorKind::InvalidData("raw size"))?;
        let compressed_size = i64::try_from(compressed.len()).or_raise(|| ErrorKind::InvalidData("compressed size"))?;
        let timestamp = now();
        let inserted: Option<(i64,)> = sqlx::query_as(include_str!("../queries/insert_chunk.sql"))
            .bind(hash)
            .bind(raw_size)
            .bind(compressed_size)
            .bind(compression.as_str())
            .bind(&location_str)
            .bind(timestamp)
            .bind(timestamp)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if inserted.is_none() {
            self.delete_blob(&location).await;
        }
        Ok(inserted.map(|(id,)| {
            tracing::debug!(chunk_id = id, raw_size, compressed_size, location = %location_str, "Stored new chunk");
            ChunkRef {
                id: ChunkId(id),
                content_hash: hash.to_string(),
                raw_size: bytes.len() as u64,
                compressed_size: compressed.len() as u64,
                deduplicated: false,
            }
        }))
    }

    /// Read, decompress, and verify a chunk.
    ///
    /// Returns [`ChunkNotFound`](ErrorKind::ChunkNotFound) when no row exists,
    /// [`ChunkUnavailable`](ErrorKind::ChunkUnavailable) when the blob cannot
    /// be read, and [`ChunkCorrupt`](ErrorKind::ChunkCorrupt) when the blob
    /// does not decompress to bytes matching the recorded hash. Decompression
    /// stops at the recorded raw size.
    #[instrument(level = "debug", skip_all, fields(key))]
    pub async fn read_chunk(&self, key: impl Into<ChunkKey>) -> Result<Vec<u8>> {
        let key = key.into();
        tracing::Span::current().record("key", tracing::field::display(&key));
        let chunk = self.get_chunk(&key).await?.ok_or_raise(|| ErrorKind::ChunkNotFound(key.clone()))?;
        let blob = match self.backend.read(&chunk.storage_location).await {
            Ok(blob) => blob,
            Err(err) => return Err(err).or_raise(|| ErrorKind::ChunkUnavailable(key)),
        };
        if chunk.compression != Compression::None && !chunk.compression.check_magic_bytes(&blob) {
            tracing::warn!(chunk_id = %chunk.id, format = %chunk.compression, "Chunk blob has wrong magic bytes");
            exn::bail!(ErrorKind::ChunkCorrupt(key));
        }
        let compression = chunk.compression;
        let raw_size = chunk.raw_size;
        let (bytes, actual_hash) = tokio::task::spawn_blocking(move || {
            compression.decompress_bounded(&blob, raw_size).map(|bytes| {
                let hash = content_hash(&bytes);
                (bytes, hash)
            })
        })
        .await
        .or_raise(|| ErrorKind::Compression)?
        .or_raise(|| ErrorKind::ChunkCorrupt(key.clone()))?;
        if actual_hash != chunk.content_hash {
            tracing::warn!(chunk_id = %chunk.id, expected = %chunk.content_hash, actual = %actual_hash, "Chunk hash mismatch");
            exn::bail!(ErrorKind::ChunkCorrupt(key));
        }
        Ok(bytes)
    }

    /// Drop one reference to a chunk.
    ///
    /// At zero references the row is deleted and the blob removed on a best
    /// effort basis. Failures are logged, never returned: the chunk is at
    /// worst left for the garbage collector.
    #[instrument(level = "debug", skip(self))]
    pub async fn release_chunk(&self, id: ChunkId) {
        let released: Option<ReleasedChunkRow> = match sqlx::query_as(include_str!("../queries/release_chunk.sql"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(released) => released,
            Err(err) => {
                tracing::warn!(chunk_id = %id, error = %err, "Failed to release chunk reference");
                return;
            },
        };
        let Some(released) = released else {
            tracing::debug!(chunk_id = %id, "Chunk already unreferenced or gone");
            return;
        };
        if released.ref_count > 0 {
            return;
        }
        match sqlx::query(include_str!("../queries/delete_zero_ref_chunk.sql"))
            .bind(id.0)
            .execute(&self.pool)
            .await
        {
            Ok(result) if result.rows_affected() == 1 => {},
            // Someone else already replaced or reclaimed the row.
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(chunk_id = %id, error = %err, "Failed to delete unreferenced chunk row");
                return;
            },
        }
        self.delete_blob(Path::new(&released.storage_location)).await;
    }

    /// Best-effort removal of a blob no row points at anymore.
    async fn delete_blob(&self, location: &Path) {
        match self.backend.delete(location).await {
            Ok(()) => tracing::debug!(location = %location.display(), "Deleted chunk blob"),
            Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => {},
            Err(err) => tracing::warn!(location = %location.display(), error = ?err, "Failed to delete chunk blob"),
        }
    }

    /// Reclaim chunks nobody references.
    ///
    /// Rows at zero references go immediately. Rows with a positive count but
    /// no version pointing at them go once untouched for the grace period,
    /// which protects saves whose chunks are ensured but whose version row is
    /// not yet committed. Returns the number of chunks removed.
    #[instrument(level = "debug", skip(self))]
    pub async fn cleanup_unused_chunks(&self) -> Result<u64> {
        let cutoff = (OffsetDateTime::now_utc() - self.grace_period).unix_timestamp();
        let rows: Vec<ChunkRow> = sqlx::query_as(include_str!("../queries/list_unused_chunks.sql"))
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let mut removed = 0;
        for row in rows {
            let chunk = Chunk::try_from(row)?;
            let deleted = sqlx::query(include_str!("../queries/delete_unused_chunk.sql"))
                .bind(chunk.id.0)
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
            if deleted.rows_affected() == 0 {
                // Referenced again since the listing.
                continue;
            }
            self.delete_blob(&chunk.storage_location).await;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "Cleaned up unused chunks");
        }
        Ok(removed)
    }
}
