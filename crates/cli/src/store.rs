use crate::error::{ErrorKind, Result};
use cirrus_config::{Config, StorageConfig};
use cirrus_storage::BackendHandle;
use cirrus_storage::backend::{LocalBackend, S3Backend, S3Options, TimeoutBackend};
use cirrus_vault::{ChunkStore, Database, GarbageCollector, UploadAssembler, VersionPolicy, VersionStore};
use exn::{OptionExt, ResultExt};
use std::sync::Arc;

const DEFAULT_REGION: &str = "us-east-1";

/// Every store wired to one database and backend.
pub struct Store {
    db: Database,
    pub versions: VersionStore,
    pub uploads: UploadAssembler,
    pub gc: GarbageCollector,
}

impl Store {
    pub async fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.database.path.parent() {
            tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io(parent.to_path_buf()))?;
        }
        let db = Database::connect(&config.database.path).await.or_raise(|| ErrorKind::Vault)?;
        let backend = backend(config)?;
        let chunks = ChunkStore::new(&db, backend.clone())
            .with_compression(config.compression().or_raise(|| ErrorKind::Config)?)
            .with_grace_period(config.gc.grace_period());
        let policy = VersionPolicy {
            checkpoint_interval: config.versions.checkpoint_interval,
            max_delta_size: config.versions.max_delta_size,
            delta_savings_ratio: config.versions.delta_savings_ratio,
            chunk_size: config.chunks.size,
            ..VersionPolicy::default()
        };
        let versions = VersionStore::new(&db, chunks.clone()).with_policy(policy);
        Ok(Self {
            uploads: UploadAssembler::new(versions.clone(), backend),
            gc: GarbageCollector::new(chunks),
            versions,
            db,
        })
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

fn backend(config: &Config) -> Result<BackendHandle> {
    let inner: BackendHandle = match &config.storage {
        StorageConfig::Local { root } => {
            let root = std::path::absolute(root).or_raise(|| ErrorKind::Io(root.clone()))?;
            Arc::new(LocalBackend::new("local", root).or_raise(|| ErrorKind::Storage)?)
        },
        StorageConfig::S3 { bucket, prefix, region, endpoint, key_id, key_secret } => {
            let options = S3Options {
                bucket: bucket.clone(),
                prefix: prefix.clone(),
                region: region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string()),
                endpoint: endpoint.clone(),
                key_id: key_id.clone().ok_or_raise(|| ErrorKind::Config)?,
                key_secret: key_secret.clone().ok_or_raise(|| ErrorKind::Config)?,
            };
            Arc::new(S3Backend::new("s3", options).or_raise(|| ErrorKind::Storage)?)
        },
    };
    tracing::debug!(backend = inner.name(), "Opened storage backend");
    Ok(Arc::new(TimeoutBackend::new(inner, config.timeouts.read(), config.timeouts.write())))
}
