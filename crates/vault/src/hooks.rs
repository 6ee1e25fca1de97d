//! Notifications to the thumbnail generator.

use crate::error::Result;
use crate::models::VersionId;
use async_trait::async_trait;

/// Receives version lifecycle events so thumbnails can be generated and
/// discarded. Failures are logged by the vault and never fail a save or a
/// release.
#[async_trait]
pub trait ThumbnailHook: Send + Sync {
    async fn version_saved(&self, file_id: &str, version_id: VersionId, mime: &str) -> Result<()>;

    async fn version_released(&self, file_id: &str, version_id: VersionId) -> Result<()>;
}

/// Hook that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopThumbnailHook;

#[async_trait]
impl ThumbnailHook for NoopThumbnailHook {
    async fn version_saved(&self, _file_id: &str, _version_id: VersionId, _mime: &str) -> Result<()> {
        Ok(())
    }

    async fn version_released(&self, _file_id: &str, _version_id: VersionId) -> Result<()> {
        Ok(())
    }
}
