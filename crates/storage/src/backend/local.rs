//! Local filesystem storage backend.
//!
//! Blobs are stored as plain files under a configured root directory and
//! accessed through `tokio::fs`.

use crate::backend::BlobInfoStream;
use crate::error::{ErrorKind, Result};
use crate::{BlobInfo, StorageBackend, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    Blob(BlobInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use cirrus_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/var/lib/cirrus")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend rooted at an absolute path.
    ///
    /// The root directory is created if it does not exist. Returns
    /// [`InvalidPath`](ErrorKind::InvalidPath) if the path is relative or
    /// points at something other than a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Runs once at startup; not worth an async constructor.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        if !absolute.is_absolute() {
            exn::bail!(ErrorKind::BackendError(format!(
                "attempting to get relative path of non-absolute path `{:?}`",
                absolute
            )))
        }
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    fn blob_info(path: &Path, metadata: Metadata) -> Result<BlobInfo> {
        let modified: OffsetDateTime = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(BlobInfo::new(path, metadata.len(), modified))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Classifies one directory entry. Kept out of the stream body so that
    /// `?` works.
    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        let relative = self.relative_path(&path)?;
        if metadata.is_dir() {
            // Descend into ancestors of the prefix as well as its descendants.
            return match prefix {
                Some(pfx) if !relative.starts_with(pfx) && !pfx.starts_with(&relative) => Ok(WalkEntry::Skip),
                _ => Ok(WalkEntry::Descend(path)),
            };
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            // Partially written temp files are never listed.
            if relative.extension().is_some_and(|ext| ext == "partial") {
                return Ok(WalkEntry::Skip);
            }
            return Ok(WalkEntry::Blob(Self::blob_info(&relative, metadata)?));
        }
        // Most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> BlobInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Same as S3: listing a missing directory is empty, not an error.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::Blob(b)) => yield Ok(b),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path))?;
        }
        // Write beside the target then rename, so readers never observe a
        // half-written blob.
        let mut partial = abs_path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        fs::write(&partial, data).await.map_err(|e| Self::map_io_error(e, path))?;
        if let Err(e) = fs::rename(&partial, &abs_path).await {
            let _ = fs::remove_file(&partial).await;
            exn::bail!(Self::map_io_error(e, path));
        }
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn stat(&self, path: &Path) -> Result<BlobInfo> {
        let validated = validate_path(path)?;
        let metadata = fs::metadata(self.root.join(&validated)).await.map_err(|e| Self::map_io_error(e, path))?;
        Self::blob_info(&validated, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("local", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("local", "relative/path").is_err());
    }

    #[test]
    fn test_new_creates_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("nested/root");
        LocalBackend::new("local", &root).unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_absolute_and_relative_paths() {
        let (temp_dir, backend) = backend();
        let abs = temp_dir.path().join("chunks/ab/abcd.gz");
        assert_eq!(backend.absolute_path("chunks/ab/abcd.gz").unwrap(), abs);
        assert_eq!(backend.relative_path(&abs).unwrap(), Path::new("chunks/ab/abcd.gz"));
        assert!(backend.absolute_path("../etc/passwd").is_err());
        assert!(backend.relative_path("/other/file").is_err());
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (_dir, backend) = backend();
        let key = Path::new("chunks/ab/abcd.gz");
        backend.write(key, b"compressed bytes").await.unwrap();
        assert!(backend.exists(key).await.unwrap());
        assert_eq!(backend.read(key).await.unwrap(), b"compressed bytes");
        backend.delete(key).await.unwrap();
        assert!(!backend.exists(key).await.unwrap());
        let err = backend.delete(key).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_write_overwrites() {
        let (_dir, backend) = backend();
        backend.write(Path::new("blob"), b"first").await.unwrap();
        backend.write(Path::new("blob"), b"second").await.unwrap();
        assert_eq!(backend.read(Path::new("blob")).await.unwrap(), b"second");
        assert_eq!(backend.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_missing() {
        let (_dir, backend) = backend();
        let err = backend.read(Path::new("chunks/00/00")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat() {
        let (_dir, backend) = backend();
        backend.write(Path::new("./chunks/ab/abcd"), b"12345").await.unwrap();
        let info = backend.stat(Path::new("chunks/ab/abcd")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("chunks/ab/abcd"));
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let (_dir, backend) = backend();
        backend.write(Path::new("chunks/ab/ab01"), b"a").await.unwrap();
        backend.write(Path::new("chunks/cd/cd01"), b"b").await.unwrap();
        backend.write(Path::new("staging/up/part-0"), b"c").await.unwrap();
        assert_eq!(backend.list(None).await.unwrap().len(), 3);
        let chunks = backend.list(Some(Path::new("chunks"))).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|b| b.path.starts_with("chunks")));
        let shard = backend.list(Some(Path::new("chunks/ab"))).await.unwrap();
        assert_eq!(shard.len(), 1);
        assert_eq!(shard[0].path, PathBuf::from("chunks/ab/ab01"));
    }

    #[tokio::test]
    async fn test_list_prefix_is_component_based() {
        let (_dir, backend) = backend();
        backend.write(Path::new("chunks/ab/x"), b"a").await.unwrap();
        backend.write(Path::new("chunks/abc/y"), b"b").await.unwrap();
        let files = backend.list(Some(Path::new("chunks/ab"))).await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_list_nonexistent_prefix() {
        let (_dir, backend) = backend();
        assert!(backend.list(Some(Path::new("nothing/here"))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_dir, backend) = backend();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.write(Path::new("../escape"), b"data").await.is_err());
        assert!(backend.delete(Path::new("../../file")).await.is_err());
    }
}
