//! Content-addressed, deduplicating, versioned file store.
//!
//! Uploaded content is cut into fixed-size chunks, each stored once
//! (compressed) under its SHA-256 and reference counted in SQLite. A file's
//! history is a sequence of immutable versions, each either a snapshot of
//! chunks or a text patch against an earlier version.
//!
//! # Architecture
//! - [`ChunkStore`]: dedup, compression, reference counting, self-healing of
//!   rows whose blob has gone missing.
//! - [`VersionStore`]: snapshot/delta decision, reconstruction, release.
//! - [`GarbageCollector`]: reclaims unreferenced chunks and orphaned blobs.
//! - [`UploadAssembler`]: turns uploads (whole or in parts) into versions.
//!
//! All of them share one [`Database`] and one storage backend, both passed in
//! at construction.

pub mod chunk;
mod db;
mod diff;
pub mod error;
pub mod gc;
mod hooks;
pub mod models;
pub mod upload;
pub mod version;

pub use crate::chunk::{ChunkStore, chunk_buffer, content_hash};
pub use crate::db::Database;
pub use crate::diff::is_text_mime;
pub use crate::gc::{GarbageCollector, GcReport};
pub use crate::hooks::{NoopThumbnailHook, ThumbnailHook};
pub use crate::upload::{Upload, UploadAssembler, UploadSource};
pub use crate::version::{ReleaseReport, SnapshotReason, VersionPolicy, VersionStore};
