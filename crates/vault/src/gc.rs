//! Garbage collection of unreferenced chunks and orphaned blobs.

use crate::chunk::{CHUNK_PREFIX, ChunkStore};
use crate::error::{ErrorKind, Result};
use crate::models::ChunkKey;
use cirrus_compress::Compression;
use cirrus_storage::error::ErrorKind as StorageErrorKind;
use exn::ResultExt;
use futures::TryStreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

/// Counts from one collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    /// Chunk rows (and their blobs) reclaimed.
    pub chunks_removed: u64,
    /// Blobs under the chunk prefix with no chunk row pointing at them.
    pub orphan_blobs_removed: u64,
}

/// Content hash encoded in a chunk blob key (`<hash>-<nonce><ext>`), if the
/// key looks like one.
fn blob_hash(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(Compression::from_path(path).extension()).unwrap_or(name);
    let (hash, nonce) = stem.split_once('-')?;
    if nonce.is_empty() || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let shard = path.parent()?.file_name()?.to_str()?;
    let well_formed = hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) && hash.starts_with(shard);
    well_formed.then_some(hash)
}

/// Reclaims storage no version needs anymore.
///
/// Both passes respect the chunk store's grace period, so chunks and blobs
/// belonging to a save that is still in flight are left alone.
#[derive(Clone)]
pub struct GarbageCollector {
    chunks: ChunkStore,
}

impl GarbageCollector {
    pub fn new(chunks: ChunkStore) -> Self {
        Self { chunks }
    }

    /// Run one full collection: unused chunk rows first, then blobs left
    /// behind without a row (for example by a crash between writing a blob
    /// and recording it).
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<GcReport> {
        let chunks_removed = self.chunks.cleanup_unused_chunks().await?;
        let orphan_blobs_removed = self.sweep_orphan_blobs().await?;
        let report = GcReport { chunks_removed, orphan_blobs_removed };
        if chunks_removed > 0 || orphan_blobs_removed > 0 {
            tracing::info!(chunks_removed, orphan_blobs_removed, "Garbage collection complete");
        } else {
            tracing::debug!("Garbage collection found nothing to remove");
        }
        Ok(report)
    }

    async fn sweep_orphan_blobs(&self) -> Result<u64> {
        let cutoff = OffsetDateTime::now_utc() - self.chunks.grace_period();
        let backend = self.chunks.backend();
        let mut candidates: Vec<(String, PathBuf)> = Vec::new();
        let mut stream = backend.list_stream(Some(Path::new(CHUNK_PREFIX)));
        while let Some(info) = stream.try_next().await.or_raise(|| ErrorKind::Storage)? {
            if info.modified > cutoff {
                continue;
            }
            match blob_hash(&info.path) {
                Some(hash) => candidates.push((hash.to_string(), info.path)),
                None => tracing::debug!(path = %info.path.display(), "Skipping unrecognised blob"),
            }
        }
        drop(stream);

        let mut removed = 0;
        for (hash, path) in candidates {
            if let Some(chunk) = self.chunks.get_chunk(&ChunkKey::Hash(hash)).await?
                && chunk.storage_location == path
            {
                continue;
            }
            match backend.delete(&path).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Deleted orphaned blob");
                    removed += 1;
                },
                Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => {},
                Err(err) => tracing::warn!(path = %path.display(), error = ?err, "Failed to delete orphaned blob"),
            }
        }
        Ok(removed)
    }

    /// Run [`run`](Self::run) every `interval` on the Tokio runtime until the
    /// returned handle is aborted. Failed passes are logged and retried on the
    /// next tick.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if let Err(err) = self.run().await {
                    tracing::error!(error = ?err, "Background garbage collection failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::chunk::content_hash;
    use cirrus_storage::backend::{MockBackend, StorageBackend};
    use rstest::rstest;
    use std::sync::Arc;

    const HASH: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    async fn collector(grace: Duration) -> (GarbageCollector, Arc<MockBackend>) {
        let db = Database::connect_in_memory().await.unwrap();
        let backend = Arc::new(MockBackend::default());
        let chunks = ChunkStore::new(&db, backend.clone()).with_grace_period(grace);
        (GarbageCollector::new(chunks), backend)
    }

    async fn age(backend: &MockBackend, path: &Path) {
        backend.set_modified(path, OffsetDateTime::now_utc() - Duration::from_secs(2 * 60 * 60)).await.unwrap();
    }

    const NONCE: &str = "0f5e2c9a41d34b7e9c1a6d8b2e4f7a90";

    #[rstest]
    #[case(format!("chunks/2c/{HASH}-{NONCE}"), Some(HASH))]
    #[case(format!("chunks/2c/{HASH}-{NONCE}.gz"), Some(HASH))]
    #[case(format!("chunks/2c/{HASH}-{NONCE}.bz2"), Some(HASH))]
    #[case(format!("chunks/ff/{HASH}-{NONCE}.gz"), None)]
    #[case(format!("chunks/2c/{HASH}.gz"), None)]
    #[case(format!("chunks/2c/{HASH}-.gz"), None)]
    #[case("chunks/2c/2cf24d-ab.gz".to_string(), None)]
    #[case("chunks/readme.txt".to_string(), None)]
    fn test_blob_hash(#[case] path: String, #[case] expected: Option<&str>) {
        assert_eq!(blob_hash(Path::new(&path)), expected);
    }

    #[tokio::test]
    async fn test_removes_aged_orphans_only() {
        let (gc, backend) = collector(Duration::from_secs(60 * 60)).await;
        let kept = gc.chunks.ensure_chunk(b"kept").await.unwrap();
        let kept = gc.chunks.get_chunk(&ChunkKey::Id(kept.id)).await.unwrap().unwrap();
        age(&backend, &kept.storage_location).await;

        let old = PathBuf::from(format!("chunks/2c/{HASH}-{NONCE}.gz"));
        backend.write(&old, b"orphan").await.unwrap();
        age(&backend, &old).await;
        let fresh_hash = content_hash(b"in flight");
        let fresh = PathBuf::from(format!("chunks/{}/{fresh_hash}-{NONCE}.gz", &fresh_hash[..2]));
        backend.write(&fresh, b"in flight").await.unwrap();

        let report = gc.run().await.unwrap();
        assert_eq!(report, GcReport { chunks_removed: 0, orphan_blobs_removed: 1 });
        assert!(!backend.exists(&old).await.unwrap());
        assert!(backend.exists(&fresh).await.unwrap());
        assert!(backend.exists(&kept.storage_location).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_blob_for_other_format_is_orphaned() {
        let (gc, backend) = collector(Duration::from_secs(60 * 60)).await;
        let chunk = gc.chunks.ensure_chunk(b"hello").await.unwrap();
        assert_eq!(chunk.content_hash, HASH);
        // Left over from when the store compressed with bzip2.
        let stale = PathBuf::from(format!("chunks/2c/{HASH}-{NONCE}.bz2"));
        backend.write(&stale, b"stale").await.unwrap();
        age(&backend, &stale).await;

        let report = gc.run().await.unwrap();
        assert_eq!(report.orphan_blobs_removed, 1);
        assert_eq!(gc.chunks.read_chunk(chunk.id).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_removes_unreferenced_chunks() {
        let (gc, backend) = collector(Duration::ZERO).await;
        gc.chunks.ensure_chunk(b"never attached to a version").await.unwrap();
        assert_eq!(backend.len().await, 1);
        let report = gc.run().await.unwrap();
        assert_eq!(report.chunks_removed, 1);
        assert!(backend.is_empty().await);
        assert_eq!(gc.run().await.unwrap(), GcReport::default());
    }

    #[tokio::test]
    async fn test_spawn_runs_in_background() {
        let (gc, backend) = collector(Duration::from_secs(60 * 60)).await;
        let orphan = PathBuf::from(format!("chunks/2c/{HASH}-{NONCE}"));
        backend.write(&orphan, b"orphan").await.unwrap();
        age(&backend, &orphan).await;

        let handle = gc.clone().spawn(Duration::from_secs(60 * 60));
        for _ in 0..100 {
            if !backend.exists(&orphan).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!backend.exists(&orphan).await.unwrap());
        handle.abort();
    }
}
