use crate::Compression;
use std::fmt::{Display, Formatter, Result as FmtResult};

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl AsRef<str> for Compression {
    fn as_ref(&self) -> &'static str {
        self.as_str()
    }
}

impl Compression {
    /// Returns the blob key extension for this compression format.
    #[inline]
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Bzip2 => ".bz2",
            Compression::Gzip => ".gz",
            #[cfg(feature = "zstd")]
            Compression::Zstd => ".zst",
        }
    }

    /// Returns the name stored in the chunk table and accepted by configuration.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Bzip2 => "bzip2",
            Compression::Gzip => "gzip",
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
        }
    }

    /// Verify that `bytes` start with the expected magic bytes for this format.
    ///
    /// Useful for cross-checking the format recorded for a chunk against the
    /// blob actually sitting in storage.
    #[must_use]
    pub fn check_magic_bytes(&self, bytes: &[u8]) -> bool {
        match Self::from_magic_bytes(bytes) {
            Some(f) => *self == f,
            None => matches!(self, Compression::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use rstest::rstest;

    #[rstest]
    #[case(Compression::None, "")]
    #[case(Compression::Bzip2, ".bz2")]
    #[case(Compression::Gzip, ".gz")]
    #[cfg_attr(feature = "zstd", case(Compression::Zstd, ".zst"))]
    fn test_extension(#[case] format: Compression, #[case] expected: &str) {
        assert_eq!(format.extension(), expected);
    }

    #[test]
    fn test_magic_bytes_match_output() {
        let compressed = Compression::Gzip.compress(b"chunk").unwrap();
        assert!(Compression::Gzip.check_magic_bytes(&compressed));
        assert!(!Compression::Bzip2.check_magic_bytes(&compressed));
        assert!(Compression::None.check_magic_bytes(b"plain text"));
    }
}
