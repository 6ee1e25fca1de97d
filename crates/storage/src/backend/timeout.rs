//! Deadline-enforcing storage backend.
//!
//! Wraps another backend and bounds how long any single blob operation may
//! take. A backend that hangs surfaces as a [`Timeout`](ErrorKind::Timeout)
//! error instead of stalling the caller forever.

use crate::error::{ErrorKind, Result};
use crate::{BackendHandle, BlobInfo, StorageBackend, backend::BlobInfoStream};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

#[derive(Clone)]
pub struct TimeoutBackend {
    inner: BackendHandle,
    read: Duration,
    write: Duration,
}
impl TimeoutBackend {
    /// `read` bounds reads, existence checks, and stats. `write` bounds
    /// writes and deletes. Listing is a stream and is not bounded.
    pub fn new(inner: BackendHandle, read: Duration, write: Duration) -> Self {
        Self { inner, read, write }
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        operation: &'static str,
        path: &Path,
        fut: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(
                    backend = self.inner.name(),
                    operation,
                    path = %path.display(),
                    limit_ms = limit.as_millis() as u64,
                    "Storage operation timed out"
                );
                exn::bail!(ErrorKind::Timeout(limit))
            },
        }
    }
}

#[async_trait]
impl StorageBackend for TimeoutBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> BlobInfoStream<'a> {
        self.inner.list_stream(prefix)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.bounded(self.read, "exists", path, self.inner.exists(path)).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.bounded(self.read, "read", path, self.inner.read(path)).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.bounded(self.write, "write", path, self.inner.write(path, data)).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.bounded(self.write, "delete", path, self.inner.delete(path)).await
    }

    async fn stat(&self, path: &Path) -> Result<BlobInfo> {
        self.bounded(self.read, "stat", path, self.inner.stat(path)).await
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_times_out() {
        let inner = Arc::new(MockBackend::with_files([("blob", b"data")]).with_latency(Duration::from_secs(5)));
        let backend = TimeoutBackend::new(inner, Duration::from_millis(100), Duration::from_millis(100));
        let err = backend.read(Path::new("blob")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operations_pass_through() {
        let inner = Arc::new(MockBackend::default().with_latency(Duration::from_millis(10)));
        let backend = TimeoutBackend::new(inner, Duration::from_secs(1), Duration::from_secs(1));
        backend.write(Path::new("blob"), b"data").await.unwrap();
        assert_eq!(backend.read(Path::new("blob")).await.unwrap(), b"data");
        let err = backend.delete(Path::new("missing")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }
}
