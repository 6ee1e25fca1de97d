//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, a unified interface for
//! blob operations across the local filesystem and S3-compatible services.

mod local;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;
mod timeout;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::{S3Backend, S3Options};
pub use self::timeout::TimeoutBackend;
use crate::BlobInfo;
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

pub(crate) type BlobInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<BlobInfo>> + Send + 'a>>;

/// Unified interface for blob storage.
///
/// All operations are asynchronous so that network backends and local disks
/// share one calling convention. Blobs are written whole and read whole;
/// chunking happens above this layer.
///
/// # Path Handling
/// All keys are relative to the storage root and must pass
/// [`validate_path`](crate::validate_path). Implementations enforce this.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use cirrus_storage::{backend::StorageBackend, error::Result};
///
/// async fn stored_size(backend: &dyn StorageBackend, key: &Path) -> Result<u64> {
///     if backend.exists(key).await? {
///         Ok(backend.read(key).await?.len() as u64)
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend. Used for logging only.
    fn name(&self) -> &str;

    /// List all blobs under an optional prefix.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`].
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<BlobInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream blob metadata under an optional prefix.
    ///
    /// Prefix matching is component based: a prefix of `chunks/ab` matches
    /// `chunks/ab/abcd` but not `chunks/abc/abcd`. A prefix that does not
    /// exist yields an empty stream, not an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// use std::path::Path;
    /// # use cirrus_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream(Some(Path::new("chunks")));
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes", info.path.display(), info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> BlobInfoStream<'a>;

    /// Check if a blob exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read the complete blob.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write a blob, replacing any existing blob under the same key.
    ///
    /// Implementations create intermediate directories as needed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Delete a blob.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Get blob metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<BlobInfo>;
}
