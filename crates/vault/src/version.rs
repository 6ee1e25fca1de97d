//! File version history.
//!
//! Every save produces an immutable [`FileVersion`] stored either as a
//! snapshot (an ordered list of chunks) or as a delta (a unified diff against
//! an earlier version of the same file). Snapshots are forced periodically so
//! that reconstructing any version walks at most one checkpoint interval of
//! patches.

use crate::Database;
use crate::chunk::{ChunkStore, DEFAULT_CHUNK_SIZE, chunk_buffer, content_hash};
use crate::diff::{UNIFIED_DIFF, apply_patch, create_patch, is_text_mime};
use crate::error::{Error, ErrorKind, Result};
use crate::hooks::{NoopThumbnailHook, ThumbnailHook};
use crate::models::{ChunkId, ChunkRef, FileVersion, NewVersion, Representation, VersionId, VersionRow};
use derive_more::Display;
use exn::{OptionExt, ResultExt};
use futures::{StreamExt, TryStreamExt, stream};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;
/// Largest patch stored as a delta: 1 MiB.
pub const DEFAULT_MAX_DELTA_SIZE: u64 = 1024 * 1024;
/// A delta must be at most this fraction of the new content's size.
pub const DEFAULT_DELTA_SAVINGS_RATIO: f64 = 0.7;
const DEFAULT_CONCURRENCY: usize = 4;
/// Upper bound on base-chain hops during reconstruction.
const MAX_CHAIN_LENGTH: usize = 4096;

/// Tunables for the snapshot/delta decision and chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionPolicy {
    /// Every version number divisible by this is stored as a snapshot.
    pub checkpoint_interval: u64,
    pub max_delta_size: u64,
    pub delta_savings_ratio: f64,
    pub chunk_size: usize,
    /// Chunks ensured or read at the same time per version.
    pub concurrency: usize,
}
impl Default for VersionPolicy {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            max_delta_size: DEFAULT_MAX_DELTA_SIZE,
            delta_savings_ratio: DEFAULT_DELTA_SAVINGS_RATIO,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}
impl VersionPolicy {
    pub fn is_checkpoint(&self, version_number: u64) -> bool {
        self.checkpoint_interval > 0 && version_number % self.checkpoint_interval == 0
    }

    pub fn accepts_patch(&self, patch_size: u64, new_size: u64) -> bool {
        patch_size <= self.max_delta_size && (patch_size as f64) <= (new_size as f64) * self.delta_savings_ratio
    }
}

/// Why a save was stored as a snapshot.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    #[display("first version")]
    First,
    #[display("checkpoint")]
    Checkpoint,
    #[display("not a text MIME type")]
    NotText,
    #[display("not valid UTF-8")]
    NotUtf8,
    #[display("no earlier version to diff against")]
    NoEarlierBase,
    #[display("previous version unreadable")]
    BaseUnreadable,
    #[display("patch too large")]
    PatchTooLarge,
}

#[derive(Debug)]
enum Decision {
    Snapshot(SnapshotReason),
    Delta { base: FileVersion, patch: String },
}

/// Outcome of [`VersionStore::release_versions`].
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub released: Vec<VersionId>,
    pub failed: Vec<(VersionId, Error)>,
}
impl ReleaseReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

async fn insert_version_row(
    conn: &mut SqliteConnection,
    new: &NewVersion,
    is_snapshot: bool,
    hash: &str,
) -> Result<VersionId> {
    if new.version_number == 0 {
        exn::bail!(ErrorKind::InvalidData("version number"));
    }
    let number = i64::try_from(new.version_number).or_raise(|| ErrorKind::InvalidData("version number"))?;
    let size = i64::try_from(new.buffer.len()).or_raise(|| ErrorKind::InvalidData("size"))?;
    let inserted: std::result::Result<(i64,), sqlx::Error> = sqlx::query_as(include_str!("../queries/insert_version.sql"))
        .bind(&new.file_id)
        .bind(number)
        .bind(is_snapshot)
        .bind(hash)
        .bind(size)
        .bind(&new.mime)
        .bind(&new.original_name)
        .bind(&new.iv)
        .bind(now())
        .fetch_one(&mut *conn)
        .await;
    match inserted {
        Ok((id,)) => Ok(VersionId(id)),
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            exn::bail!(ErrorKind::VersionExists(new.file_id.clone(), new.version_number))
        },
        Err(err) => Err(err).or_raise(|| ErrorKind::Database),
    }
}

/// Snapshot/delta version store.
#[derive(Clone)]
pub struct VersionStore {
    pool: SqlitePool,
    chunks: ChunkStore,
    policy: VersionPolicy,
    hook: Arc<dyn ThumbnailHook>,
}

impl VersionStore {
    pub fn new(db: &Database, chunks: ChunkStore) -> Self {
        Self {
            pool: db.pool().clone(),
            chunks,
            policy: VersionPolicy::default(),
            hook: Arc::new(NoopThumbnailHook),
        }
    }

    pub fn with_policy(mut self, policy: VersionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_thumbnail_hook(mut self, hook: Arc<dyn ThumbnailHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn policy(&self) -> &VersionPolicy {
        &self.policy
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    async fn hydrate(&self, row: VersionRow) -> Result<FileVersion> {
        let chunks = if row.is_snapshot {
            let ids: Vec<(i64,)> = sqlx::query_as(include_str!("../queries/get_version_chunks.sql"))
                .bind(row.id)
                .fetch_all(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
            ids.into_iter().map(|(id,)| ChunkId(id)).collect()
        } else {
            Vec::new()
        };
        FileVersion::try_from((row, chunks))
    }

    pub async fn get_version(&self, id: VersionId) -> Result<Option<FileVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(include_str!("../queries/get_version.sql"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match row {
            Some(row) => self.hydrate(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// The version with the highest version number for a file.
    pub async fn get_latest_version(&self, file_id: &str) -> Result<Option<FileVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(include_str!("../queries/get_latest_version.sql"))
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match row {
            Some(row) => self.hydrate(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// All versions of a file, oldest first.
    pub async fn list_versions(&self, file_id: &str) -> Result<Vec<FileVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(include_str!("../queries/list_versions.sql"))
            .bind(file_id)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let mut versions = Vec::with_capacity(rows.len());
        for row in rows {
            versions.push(self.hydrate(row).await?);
        }
        Ok(versions)
    }

    // =========================================================================
    // Save
    // =========================================================================

    async fn decide(&self, new: &NewVersion) -> Result<Decision> {
        let Some(previous) = self.get_latest_version(&new.file_id).await? else {
            return Ok(Decision::Snapshot(SnapshotReason::First));
        };
        if previous.version_number >= new.version_number {
            return Ok(Decision::Snapshot(SnapshotReason::NoEarlierBase));
        }
        if self.policy.is_checkpoint(new.version_number) {
            return Ok(Decision::Snapshot(SnapshotReason::Checkpoint));
        }
        if !is_text_mime(&new.mime) {
            return Ok(Decision::Snapshot(SnapshotReason::NotText));
        }
        let Ok(target) = std::str::from_utf8(&new.buffer) else {
            return Ok(Decision::Snapshot(SnapshotReason::NotUtf8));
        };
        let base = match self.build_buffer_from_version(previous.id).await {
            Ok(base) => base,
            Err(err) => {
                tracing::warn!(version_id = %previous.id, error = ?err, "Previous version unreadable, storing snapshot");
                return Ok(Decision::Snapshot(SnapshotReason::BaseUnreadable));
            },
        };
        let Ok(base) = String::from_utf8(base) else {
            return Ok(Decision::Snapshot(SnapshotReason::NotUtf8));
        };
        let patch = create_patch(&base, target);
        if !self.policy.accepts_patch(patch.len() as u64, new.buffer.len() as u64) {
            return Ok(Decision::Snapshot(SnapshotReason::PatchTooLarge));
        }
        Ok(Decision::Delta { base: previous, patch })
    }

    /// Save a new version, choosing between a snapshot and a delta against
    /// the file's latest version.
    ///
    /// The first version of a file, every checkpoint, non-text content, and
    /// patches that would not save enough space are stored as snapshots.
    #[instrument(level = "debug", skip_all, fields(file_id = %new.file_id, version_number = new.version_number, size = new.buffer.len()))]
    pub async fn decide_and_save_version(&self, new: NewVersion) -> Result<FileVersion> {
        match self.decide(&new).await? {
            Decision::Snapshot(reason) => {
                tracing::debug!(%reason, "Storing snapshot");
                self.save_snapshot_version(&new).await
            },
            Decision::Delta { base, patch } => {
                tracing::debug!(base_version_id = %base.id, patch_size = patch.len(), "Storing delta");
                self.insert_delta(&new, &base, patch).await
            },
        }
    }

    /// Store the full content as chunks.
    ///
    /// Chunk references taken for this version are released again if the
    /// version cannot be recorded.
    pub async fn save_snapshot_version(&self, new: &NewVersion) -> Result<FileVersion> {
        let hash = content_hash(&new.buffer);
        let results: Vec<Result<ChunkRef>> = stream::iter(chunk_buffer(&new.buffer, self.policy.chunk_size))
            .map(|piece| self.chunks.ensure_chunk(piece))
            .buffered(self.policy.concurrency.max(1))
            .collect()
            .await;
        let mut refs = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(chunk) => refs.push(chunk),
                Err(err) if failure.is_none() => failure = Some(err),
                Err(_) => {},
            }
        }
        if let Some(err) = failure {
            self.release_refs(&refs).await;
            return Err(err);
        }
        let id = match self.insert_snapshot(new, &hash, &refs).await {
            Ok(id) => id,
            Err(err) => {
                self.release_refs(&refs).await;
                return Err(err);
            },
        };
        let deduplicated = refs.iter().filter(|c| c.deduplicated).count();
        tracing::debug!(version_id = %id, chunks = refs.len(), deduplicated, "Saved snapshot");
        self.saved(id).await
    }

    async fn insert_snapshot(&self, new: &NewVersion, hash: &str, refs: &[ChunkRef]) -> Result<VersionId> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let id = insert_version_row(&mut *tx, new, true, hash).await?;
        for (idx, chunk) in refs.iter().enumerate() {
            sqlx::query(include_str!("../queries/insert_version_chunk.sql"))
                .bind(id.0)
                .bind(idx as i64)
                .bind(chunk.id.0)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(id)
    }

    async fn release_refs(&self, refs: &[ChunkRef]) {
        for chunk in refs {
            self.chunks.release_chunk(chunk.id).await;
        }
    }

    /// Store the content as a patch against `base_version_id`.
    ///
    /// The base must be a strictly earlier version of the same file, and both
    /// the base content and the new content must be UTF-8.
    pub async fn save_delta_version(&self, new: &NewVersion, base_version_id: VersionId) -> Result<FileVersion> {
        let base = self
            .get_version(base_version_id)
            .await?
            .ok_or_raise(|| ErrorKind::BaseVersionMissing(base_version_id))?;
        let target = std::str::from_utf8(&new.buffer).or_raise(|| ErrorKind::NotText)?;
        let base_text = String::from_utf8(self.build_buffer_from_version(base.id).await?).or_raise(|| ErrorKind::NotText)?;
        let patch = create_patch(&base_text, target);
        self.insert_delta(new, &base, patch).await
    }

    async fn insert_delta(&self, new: &NewVersion, base: &FileVersion, patch: String) -> Result<FileVersion> {
        if base.file_id != new.file_id || base.version_number >= new.version_number {
            exn::bail!(ErrorKind::InvalidBase(base.id));
        }
        let hash = content_hash(&new.buffer);
        let patch_size = i64::try_from(patch.len()).or_raise(|| ErrorKind::InvalidData("patch size"))?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let id = insert_version_row(&mut *tx, new, false, &hash).await?;
        sqlx::query(include_str!("../queries/insert_delta.sql"))
            .bind(id.0)
            .bind(base.id.0)
            .bind(UNIFIED_DIFF)
            .bind(&patch)
            .bind(patch_size)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        tracing::debug!(version_id = %id, base_version_id = %base.id, patch_size, "Saved delta");
        self.saved(id).await
    }

    async fn saved(&self, id: VersionId) -> Result<FileVersion> {
        let version = self.get_version(id).await?.ok_or_raise(|| ErrorKind::VersionNotFound(id))?;
        if let Err(err) = self.hook.version_saved(&version.file_id, version.id, &version.mime).await {
            tracing::warn!(version_id = %version.id, error = ?err, "Thumbnail hook failed after save");
        }
        Ok(version)
    }

    // =========================================================================
    // Reconstruct
    // =========================================================================

    async fn read_snapshot(&self, id: VersionId, chunks: &[ChunkId]) -> Result<Vec<u8>> {
        let pieces: Vec<Vec<u8>> = stream::iter(chunks.iter().copied())
            .map(|chunk| self.chunks.read_chunk(chunk))
            .buffered(self.policy.concurrency.max(1))
            .try_collect()
            .await
            .or_raise(|| ErrorKind::ContentMissing(id))?;
        Ok(pieces.concat())
    }

    /// Reconstruct the full content of a version.
    ///
    /// Deltas are resolved by walking base versions down to a snapshot, then
    /// applying patches oldest first. The result is verified against the
    /// version's content hash; no partial content is ever returned.
    #[instrument(level = "debug", skip(self))]
    pub async fn build_buffer_from_version(&self, version_id: VersionId) -> Result<Vec<u8>> {
        let target = self.get_version(version_id).await?.ok_or_raise(|| ErrorKind::VersionNotFound(version_id))?;
        let mut chain: Vec<(VersionId, String)> = Vec::new();
        let mut current = target.clone();
        let snapshot = loop {
            match current.representation {
                Representation::Snapshot { chunks } => break self.read_snapshot(current.id, &chunks).await?,
                Representation::Delta { base_version_id, patch, .. } => {
                    if chain.len() >= MAX_CHAIN_LENGTH {
                        exn::bail!(ErrorKind::InvalidData("delta chain too long"));
                    }
                    chain.push((current.id, patch));
                    current = self
                        .get_version(base_version_id)
                        .await?
                        .ok_or_raise(|| ErrorKind::BaseVersionMissing(base_version_id))?;
                },
            }
        };

        let content = match chain.last() {
            None => snapshot,
            Some((oldest, _)) => {
                let mut text = String::from_utf8(snapshot).or_raise(|| ErrorKind::PatchApplyFailed(*oldest))?;
                for (id, patch) in chain.iter().rev() {
                    text = apply_patch(&text, patch, *id)?;
                }
                text.into_bytes()
            },
        };
        if content_hash(&content) != target.content_hash {
            tracing::warn!(%version_id, "Reconstructed content does not match its hash");
            exn::bail!(match target.is_snapshot() {
                true => ErrorKind::ContentMissing(version_id),
                false => ErrorKind::PatchApplyFailed(version_id),
            });
        }
        Ok(content)
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Delete versions and drop their chunk references.
    ///
    /// Versions are processed newest first, so a delta released together
    /// with its base goes before the base does. A version that is still the
    /// base of a stored delta is refused with
    /// [`BaseInUse`](ErrorKind::BaseInUse). Failures are collected per
    /// version and do not stop the others.
    #[instrument(level = "debug", skip_all, fields(count = version_ids.len()))]
    pub async fn release_versions(&self, version_ids: &[VersionId]) -> ReleaseReport {
        let mut ordered = version_ids.to_vec();
        ordered.sort_unstable_by(|a, b| b.cmp(a));
        ordered.dedup();
        let mut report = ReleaseReport::default();
        for id in ordered {
            match self.release_version(id).await {
                Ok(()) => report.released.push(id),
                Err(err) => {
                    tracing::warn!(version_id = %id, error = ?err, "Failed to release version");
                    report.failed.push((id, err));
                },
            }
        }
        report
    }

    async fn release_version(&self, id: VersionId) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let row: Option<VersionRow> = sqlx::query_as(include_str!("../queries/get_version.sql"))
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let row = row.ok_or_raise(|| ErrorKind::VersionNotFound(id))?;
        let dependent: Option<(i64,)> = sqlx::query_as(include_str!("../queries/get_dependent_delta.sql"))
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if let Some((dependent,)) = dependent {
            tracing::debug!(version_id = %id, dependent, "Version is still a delta base");
            exn::bail!(ErrorKind::BaseInUse(id));
        }
        let chunk_ids: Vec<(i64,)> = sqlx::query_as(include_str!("../queries/get_version_chunks.sql"))
            .bind(id.0)
            .fetch_all(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/delete_version.sql"))
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;

        // Once per occurrence: a chunk repeated within a version holds one
        // reference per position.
        for (chunk_id,) in chunk_ids {
            self.chunks.release_chunk(ChunkId(chunk_id)).await;
        }
        if let Err(err) = self.hook.version_released(&row.file_id, id).await {
            tracing::warn!(version_id = %id, error = ?err, "Thumbnail hook failed after release");
        }
        tracing::debug!(version_id = %id, file_id = %row.file_id, "Released version");
        Ok(())
    }
}
