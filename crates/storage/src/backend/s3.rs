//! S3-compatible storage backend.
//!
//! Works against AWS S3 and S3-compatible services (Backblaze B2, Tigris,
//! MinIO). Credentials are provided explicitly through configuration.

use crate::{
    BlobInfo, StorageBackend,
    backend::BlobInfoStream,
    error::{ErrorKind, Result},
    validate_path,
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// Connection settings for [`S3Backend::new`].
#[derive(Debug, Clone)]
pub struct S3Options {
    pub bucket: String,
    /// Optional key prefix (acts as a virtual directory)
    pub prefix: Option<String>,
    /// AWS region or provider-specific region (e.g. "us-west-004")
    pub region: String,
    /// Custom endpoint URL for S3-compatible services
    pub endpoint: Option<String>,
    pub key_id: String,
    pub key_secret: String,
}

/// S3-compatible storage backend.
///
/// Blob keys are relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use cirrus_storage::backend::{S3Backend, S3Options};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new("b2", S3Options {
///     bucket: "my-bucket".to_string(),
///     prefix: Some("vault/".to_string()),
///     region: "us-west-004".to_string(),
///     endpoint: Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     key_id: "access_key_id".to_string(),
///     key_secret: "secret_access_key".to_string(),
/// })?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    pub fn new(name: impl Into<String>, options: S3Options) -> Result<Self> {
        let credentials = Credentials::new(options.key_id, options.key_secret, None, None, "cirrus-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(options.region))
            // 1 initial attempt + 3 retries with exponential backoff.
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services.
            .force_path_style(true);
        if let Some(endpoint_url) = options.endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let client = Client::from_conf(config_builder.build());
        Self::from_client(name, client, options.bucket, options.prefix)
    }

    /// Build a backend around an already configured client.
    pub fn from_client(
        name: impl Into<String>,
        client: Client,
        bucket: impl Into<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .map(validate_path)
            .transpose()?
            .map(|p| p.to_str().map(|s| s.to_string()).ok_or_raise(|| ErrorKind::InvalidPath(p)))
            .transpose()?;
        Ok(Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Construct the full S3 key from a relative path.
    fn full_key(&self, path: &Path) -> Result<String> {
        let validated = validate_path(path)?;
        let path_str = validated.to_str().ok_or_raise(|| ErrorKind::InvalidPath(validated.clone()))?;
        Ok(match &self.prefix {
            Some(prefix) => format!("{prefix}/{path_str}"),
            None => path_str.to_string(),
        })
    }

    /// Strip the configured prefix from an S3 key to get a relative path.
    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        let relative = match &self.prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str()).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
            None => key,
        };
        validate_path(relative)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }

    fn parse_datetime(dt: &DateTime) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
            .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string()))
    }

    fn map_sdk_error<E, R>(err: &SdkError<E, R>) -> ErrorKind
    where
        E: std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        let message = DisplayErrorContext(err).to_string();
        match err {
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ErrorKind::Network(message),
            _ => ErrorKind::BackendError(message),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> BlobInfoStream<'a> {
        // Trailing slash keeps prefix matching component based.
        let key_prefix = match prefix {
            Some(pfx) => match self.full_key(pfx) {
                Ok(key) => Some(format!("{key}/")),
                Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
            },
            None => self.prefix.as_ref().map(|p| format!("{p}/")),
        };

        Box::pin(stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(key_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_sdk_error(&err)));
                        return;
                    }
                };
                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    let path = match self.relative_path(key) {
                        Ok(path) => path,
                        Err(e) => { yield Err(e); continue; },
                    };
                    let modified = match object.last_modified().map(Self::parse_datetime).transpose() {
                        Ok(modified) => modified.unwrap_or(OffsetDateTime::UNIX_EPOCH),
                        Err(e) => { yield Err(e); continue; },
                    };
                    let size = object.size().unwrap_or_default().max(0) as u64;
                    yield Ok(BlobInfo::new(path, size, modified));
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(err) if matches!(&*err, ErrorKind::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(err) => exn::bail!(Self::map_sdk_error(&err)),
        };
        let body = output.body.collect().await.or_raise(|| ErrorKind::Network(format!("reading body of {key}")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(&err))?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        // DeleteObject succeeds on missing keys; check first so that callers
        // see the same NotFound as on other backends.
        if !self.exists(path).await? {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(&err))?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<BlobInfo> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(err) => exn::bail!(Self::map_sdk_error(&err)),
        };
        let modified = match output.last_modified() {
            Some(dt) => Self::parse_datetime(dt)?,
            None => OffsetDateTime::UNIX_EPOCH,
        };
        let size = output.content_length().unwrap_or_default().max(0) as u64;
        Ok(BlobInfo::new(validate_path(path)?, size, modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::{GetObjectError, GetObjectOutput};
    use aws_sdk_s3::operation::head_object::{HeadObjectError, HeadObjectOutput};
    use aws_sdk_s3::types::error::{NoSuchKey, NotFound};
    use aws_smithy_mocks::{mock, mock_client};

    fn backend(client: Client, prefix: Option<&str>) -> S3Backend {
        S3Backend::from_client("s3", client, "bucket", prefix.map(str::to_string)).unwrap()
    }

    fn offline_backend(prefix: Option<&str>) -> S3Backend {
        let options = S3Options {
            bucket: "bucket".to_string(),
            prefix: prefix.map(str::to_string),
            region: "us-east-1".to_string(),
            endpoint: Some("http://127.0.0.1:9".to_string()),
            key_id: "id".to_string(),
            key_secret: "secret".to_string(),
        };
        S3Backend::new("s3", options).unwrap()
    }

    #[test]
    fn test_full_key() {
        assert_eq!(offline_backend(None).full_key(Path::new("chunks/ab/abcd")).unwrap(), "chunks/ab/abcd");
        assert_eq!(offline_backend(Some("vault/")).full_key(Path::new("chunks/ab/abcd")).unwrap(), "vault/chunks/ab/abcd");
        assert!(offline_backend(None).full_key(Path::new("../escape")).is_err());
    }

    #[test]
    fn test_relative_path() {
        let backend = offline_backend(Some("vault"));
        assert_eq!(backend.relative_path("vault/chunks/ab/abcd").unwrap(), Path::new("chunks/ab/abcd"));
        assert_eq!(offline_backend(None).relative_path("chunks/ab").unwrap(), Path::new("chunks/ab"));
    }

    #[test]
    fn test_prefix_traversal_rejected() {
        let client = offline_backend(None).client;
        assert!(S3Backend::from_client("s3", client, "bucket", Some("../up".to_string())).is_err());
    }

    #[tokio::test]
    async fn test_read() {
        let get = mock!(aws_sdk_s3::Client::get_object)
            .match_requests(|req| req.bucket() == Some("bucket") && req.key() == Some("vault/chunks/ab/abcd"))
            .then_output(|| GetObjectOutput::builder().body(ByteStream::from_static(b"blob")).build());
        let backend = backend(mock_client!(aws_sdk_s3, [&get]), Some("vault"));
        assert_eq!(backend.read(Path::new("chunks/ab/abcd")).await.unwrap(), b"blob");
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let get = mock!(aws_sdk_s3::Client::get_object)
            .then_error(|| GetObjectError::NoSuchKey(NoSuchKey::builder().build()));
        let backend = backend(mock_client!(aws_sdk_s3, [&get]), None);
        let err = backend.read(Path::new("chunks/ab/abcd")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat_and_exists() {
        let head = mock!(aws_sdk_s3::Client::head_object)
            .match_requests(|req| req.key() == Some("chunks/ab/abcd"))
            .then_output(|| HeadObjectOutput::builder().content_length(42).build());
        let missing = mock!(aws_sdk_s3::Client::head_object)
            .then_error(|| HeadObjectError::NotFound(NotFound::builder().build()));
        let backend = backend(mock_client!(aws_sdk_s3, [&head, &missing]), None);
        let info = backend.stat(Path::new("chunks/ab/abcd")).await.unwrap();
        assert_eq!(info.size, 42);
        assert!(!backend.exists(Path::new("chunks/cd/cdef")).await.unwrap());
    }
}
