//! Hand-off from the upload pipeline.

use crate::error::{ErrorKind, Result};
use crate::models::{FileVersion, NewVersion};
use crate::version::VersionStore;
use cirrus_storage::BackendHandle;
use exn::ResultExt;
use std::path::PathBuf;
use tracing::instrument;

/// Where the content of an upload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    /// Fully assembled content.
    Buffer(Vec<u8>),
    /// Keys in the staging backend, concatenated in order.
    Parts(Vec<PathBuf>),
}

/// A finished upload waiting to become the next version of a file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_id: String,
    pub mime: String,
    pub original_name: String,
    pub iv: Option<String>,
    pub source: UploadSource,
}
impl Upload {
    pub fn new(file_id: impl Into<String>, source: UploadSource) -> Self {
        let file_id = file_id.into();
        Self {
            original_name: file_id.clone(),
            file_id,
            mime: "application/octet-stream".to_string(),
            iv: None,
            source,
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

/// Turns uploads into versions.
///
/// Multi-part uploads are read from a staging backend, concatenated, and
/// saved as the file's next version number. Part files are removed once the
/// version is stored; on failure they are left for the caller to retry.
#[derive(Clone)]
pub struct UploadAssembler {
    versions: VersionStore,
    staging: BackendHandle,
}

impl UploadAssembler {
    pub fn new(versions: VersionStore, staging: BackendHandle) -> Self {
        Self { versions, staging }
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    async fn assemble(&self, parts: &[PathBuf]) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for part in parts {
            let bytes = self.staging.read(part).await.or_raise(|| ErrorKind::Upload)?;
            buffer.extend_from_slice(&bytes);
        }
        Ok(buffer)
    }

    /// Save an upload as the next version of its file.
    ///
    /// Concurrent uploads to the same file race for the version number; the
    /// loser fails with [`VersionExists`](ErrorKind::VersionExists), which is
    /// retryable.
    #[instrument(skip_all, fields(file_id = %upload.file_id))]
    pub async fn save(&self, upload: Upload) -> Result<FileVersion> {
        let Upload { file_id, mime, original_name, iv, source } = upload;
        let (buffer, parts) = match source {
            UploadSource::Buffer(buffer) => (buffer, Vec::new()),
            UploadSource::Parts(parts) => (self.assemble(&parts).await?, parts),
        };
        let version_number = self
            .versions
            .get_latest_version(&file_id)
            .await?
            .map_or(1, |latest| latest.version_number + 1);
        let mut new = NewVersion::new(file_id, version_number, buffer).with_mime(mime).with_name(original_name);
        if let Some(iv) = iv {
            new = new.with_iv(iv);
        }
        let version = self.versions.decide_and_save_version(new).await?;

        for part in &parts {
            if let Err(err) = self.staging.delete(part).await {
                tracing::warn!(part = %part.display(), error = ?err, "Failed to remove upload part");
            }
        }
        tracing::info!(version_id = %version.id, version_number, size = version.size, "Stored upload");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::chunk::ChunkStore;
    use cirrus_storage::backend::{MockBackend, StorageBackend};
    use std::sync::Arc;

    async fn assembler(staging: Arc<MockBackend>) -> UploadAssembler {
        let db = Database::connect_in_memory().await.unwrap();
        let chunks = ChunkStore::new(&db, Arc::new(MockBackend::default()));
        UploadAssembler::new(VersionStore::new(&db, chunks), staging)
    }

    #[tokio::test]
    async fn test_parts_are_concatenated_in_order() {
        let staging = Arc::new(MockBackend::with_files([
            ("uploads/a/2", b"world".to_vec()),
            ("uploads/a/1", b"hello ".to_vec()),
        ]));
        let assembler = assembler(staging.clone()).await;
        let upload = Upload::new(
            "greeting",
            UploadSource::Parts(vec![PathBuf::from("uploads/a/1"), PathBuf::from("uploads/a/2")]),
        )
        .with_mime("text/plain")
        .with_name("greeting.txt")
        .with_iv("00ff");
        let version = assembler.save(upload).await.unwrap();

        assert_eq!(version.version_number, 1);
        assert_eq!(version.size, 11);
        assert_eq!(version.original_name, "greeting.txt");
        assert_eq!(version.iv.as_deref(), Some("00ff"));
        assert_eq!(assembler.versions().build_buffer_from_version(version.id).await.unwrap(), b"hello world");
        assert!(staging.is_empty().await);
    }

    #[tokio::test]
    async fn test_buffer_uploads_take_next_version_number() {
        let assembler = assembler(Arc::new(MockBackend::default())).await;
        for expected in 1..=3 {
            let upload = Upload::new("doc", UploadSource::Buffer(format!("revision {expected}\n").into_bytes()));
            assert_eq!(assembler.save(upload).await.unwrap().version_number, expected);
        }
    }

    #[tokio::test]
    async fn test_missing_part_keeps_the_rest() {
        let staging = Arc::new(MockBackend::with_files([("uploads/b/1", b"first".to_vec())]));
        let assembler = assembler(staging.clone()).await;
        let upload = Upload::new(
            "broken",
            UploadSource::Parts(vec![PathBuf::from("uploads/b/1"), PathBuf::from("uploads/b/2")]),
        );
        let err = assembler.save(upload).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Upload));
        assert!(staging.exists(&PathBuf::from("uploads/b/1")).await.unwrap());
        assert!(assembler.versions().get_latest_version("broken").await.unwrap().is_none());
    }
}
