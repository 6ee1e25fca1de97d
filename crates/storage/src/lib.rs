//! Blob storage for content-addressed chunks.
//!
//! The vault never touches a filesystem or an object store directly; it talks
//! to a [`StorageBackend`] handed to it at construction time. Backends store
//! opaque byte blobs under validated, root-relative keys.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::models::BlobInfo;
pub use crate::path::{shard as shard_path, validate as validate_path};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
