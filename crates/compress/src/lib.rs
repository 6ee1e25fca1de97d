//! Compression of chunk blobs.
//!
//! Every chunk written by the vault is compressed before it reaches a storage
//! backend, and the format used is recorded alongside the chunk so that the
//! configured format can change without invalidating older blobs. This crate
//! wraps the compression libraries behind a single [`Compression`] enum:
//!
//! - **Parsing** from configuration names ([`str::parse`]) and detection from
//!   blob keys ([`Compression::from_path`]) or magic bytes
//!   ([`Compression::from_magic_bytes`])
//! - **In-memory** compression/decompression ([`Compression::compress`],
//!   [`Compression::decompress`])
//!
//! Gzip and Bzip2 are always available. Zstd is behind the `zstd` feature.
//! Chunks sit on the upload hot path, so every format uses its library's
//! default level rather than the strongest one.

mod construct;
pub mod error;
mod ops;
mod util;

/// A supported compression format.
///
/// Defaults to [`Gzip`](Self::Gzip), the format new chunks are written with
/// unless configured otherwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Stored as-is
    None,
    /// Bzip2 compression (.bz2)
    Bzip2,
    /// Gzip compression (.gz)
    #[default]
    Gzip,
    /// Zstd compression (.zst)
    #[cfg(feature = "zstd")]
    Zstd,
}
