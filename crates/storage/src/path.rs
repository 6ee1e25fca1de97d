//! Blob key validation and sharding.
//!
//! Every key handed to a backend is relative to that backend's root. Keys that
//! would escape the root are rejected before any I/O happens.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path, PathBuf};

/// Validates and normalizes a blob key.
///
/// Null bytes, Windows prefixes, and `..` components that climb above the
/// root are rejected with [`InvalidPath`](crate::error::ErrorKind::InvalidPath).
/// An empty key (after normalization) is also rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use cirrus_storage::validate_path;
///
/// assert!(validate_path("chunks/ab/abcdef.gz").is_ok());
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(
///     validate_path("chunks/./xx/../ab//abcdef.gz/").unwrap(),
///     Path::new("chunks/ab/abcdef.gz")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let mut components = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes survive Path::components() on Unix but truncate in syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(original.to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
                }
            },
        }
    }
    if components.is_empty() {
        exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
    }
    Ok(components.into_iter().collect())
}

/// Builds the sharded key `<prefix>/<hash[..2]>/<hash><suffix>`, where the
/// suffix is typically a compression extension.
///
/// The two-character shard keeps directory fan-out bounded on filesystem
/// backends. The hash must be at least two ASCII hex digits.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use cirrus_storage::shard_path;
///
/// assert_eq!(
///     shard_path("chunks", "abcdef0123", ".gz").unwrap(),
///     Path::new("chunks/ab/abcdef0123.gz")
/// );
/// assert!(shard_path("chunks", "../x", "").is_err());
/// ```
pub fn shard(prefix: impl AsRef<Path>, hash: &str, extension: &str) -> Result<PathBuf> {
    if hash.len() < 2 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        exn::bail!(ErrorKind::InvalidPath(PathBuf::from(hash)));
    }
    let key = prefix.as_ref().join(&hash[..2]).join(format!("{hash}{extension}"));
    validate(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert_eq!(validate("chunks/ab/abcd.gz").unwrap(), Path::new("chunks/ab/abcd.gz"));
        assert_eq!(validate("staging/upload-1/part-0").unwrap(), Path::new("staging/upload-1/part-0"));
        assert_eq!(validate("single").unwrap(), Path::new("single"));
    }

    #[test]
    fn test_normalization() {
        assert_eq!(validate("a//b//c").unwrap(), Path::new("a/b/c"));
        assert_eq!(validate("a/./b/./c").unwrap(), Path::new("a/b/c"));
        assert_eq!(validate("a/b/..").unwrap(), Path::new("a"));
        assert_eq!(validate("chunks///").unwrap(), Path::new("chunks"));
        // Leading slash is treated as relative to the backend root.
        assert_eq!(validate("/chunks/ab").unwrap(), Path::new("chunks/ab"));
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(validate("../etc/passwd").is_err());
        assert!(validate("a/../../b").is_err());
        assert!(validate("..").is_err());
    }

    #[test]
    fn test_null_bytes_rejected() {
        assert!(validate("a\0b").is_err());
        assert!(validate("\0").is_err());
    }

    #[test]
    fn test_empty_rejected() {
        assert!(validate("").is_err());
        assert!(validate(".").is_err());
        assert!(validate("./.").is_err());
        assert!(validate("//").is_err());
    }

    #[test]
    fn test_shard() {
        let hash = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let key = shard("chunks", hash, ".bz2").unwrap();
        assert_eq!(key, PathBuf::from(format!("chunks/e3/{hash}.bz2")));
        assert_eq!(shard("chunks", "ff", "").unwrap(), Path::new("chunks/ff/ff"));
    }

    #[test]
    fn test_shard_rejects_non_hex() {
        assert!(shard("chunks", "a", "").is_err());
        assert!(shard("chunks", "zz", "").is_err());
        assert!(shard("chunks", "ab/../..", "").is_err());
    }
}
