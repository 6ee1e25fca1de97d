//! Compression Operations

use crate::Compression;
use crate::error::{ErrorKind, Result};
use bzip2::{Compression as BzCompression, read::BzDecoder, write::BzEncoder};
use exn::ResultExt;
use flate2::{Compression as GzCompression, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
use tracing::instrument;
#[cfg(feature = "zstd")]
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

const BZIP2_LEVEL: u32 = 6;
const GZIP_LEVEL: u32 = 6;
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

impl Compression {
    /// Compress a byte slice in memory.
    ///
    /// # Examples
    ///
    /// ```
    /// use cirrus_compress::Compression;
    ///
    /// let data = b"Hello, world!";
    /// let compressed = Compression::Gzip.compress(data).unwrap();
    /// assert_ne!(compressed, data);
    /// ```
    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.compress_into(input, &mut output)?;
        Ok(output)
    }

    /// Decompress a byte slice in memory.
    ///
    /// # Examples
    ///
    /// ```
    /// use cirrus_compress::Compression;
    ///
    /// let original = b"Hello, world!";
    /// let compressed = Compression::Bzip2.compress(original).unwrap();
    /// let decompressed = Compression::Bzip2.decompress(&compressed).unwrap();
    /// assert_eq!(decompressed, original);
    /// ```
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.decompress_into(input, &mut output)?;
        Ok(output)
    }

    /// Decompress at most `limit` bytes, failing with
    /// [`TooLarge`](ErrorKind::TooLarge) as soon as the output would exceed
    /// it.
    ///
    /// # Examples
    ///
    /// ```
    /// use cirrus_compress::Compression;
    ///
    /// let compressed = Compression::Gzip.compress(&[0u8; 4096]).unwrap();
    /// assert_eq!(Compression::Gzip.decompress_bounded(&compressed, 4096).unwrap().len(), 4096);
    /// assert!(Compression::Gzip.decompress_bounded(&compressed, 4095).is_err());
    /// ```
    #[instrument(level = "trace", skip(input), fields(format = %self, input_size = input.len()))]
    pub fn decompress_bounded(&self, input: &[u8], limit: u64) -> Result<Vec<u8>> {
        let decoder: Box<dyn Read + '_> = match self {
            Compression::None => Box::new(input),
            Compression::Bzip2 => Box::new(BzDecoder::new(input)),
            Compression::Gzip => Box::new(GzDecoder::new(input)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => Box::new(ZstdDecoder::new(input).or_raise(|| ErrorKind::Encoder)?),
        };
        let mut output = Vec::new();
        decoder
            .take(limit.saturating_add(1))
            .read_to_end(&mut output)
            .or_raise(|| ErrorKind::InvalidData)?;
        if output.len() as u64 > limit {
            exn::bail!(ErrorKind::TooLarge(limit));
        }
        Ok(output)
    }

    #[instrument(level = "trace", skip(input, output), fields(
        format = %self,
        input_size = input.len(),
        output_size
    ))]
    pub fn compress_into(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        let size = match self {
            Compression::None => {
                output.extend_from_slice(input);
                input.len()
            },
            Compression::Bzip2 => {
                let mut encoder = BzEncoder::new(&mut *output, BzCompression::new(BZIP2_LEVEL));
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
                output.len()
            },
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(&mut *output, GzCompression::new(GZIP_LEVEL));
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
                output.len()
            },
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                let mut encoder = ZstdEncoder::new(&mut *output, ZSTD_LEVEL).or_raise(|| ErrorKind::Encoder)?;
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
                output.len()
            },
        };
        tracing::Span::current().record("output_size", size);
        Ok(size)
    }

    #[instrument(level = "trace", skip(input, output), fields(
        format = %self,
        input_size = input.len(),
        output_size
    ))]
    pub fn decompress_into(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        let size = match self {
            Compression::None => {
                output.extend_from_slice(input);
                input.len()
            },
            Compression::Bzip2 => {
                let mut decoder = BzDecoder::new(input);
                decoder.read_to_end(output).or_raise(|| ErrorKind::InvalidData)?
            },
            Compression::Gzip => {
                let mut decoder = GzDecoder::new(input);
                decoder.read_to_end(output).or_raise(|| ErrorKind::InvalidData)?
            },
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                let mut decoder = ZstdDecoder::new(input).or_raise(|| ErrorKind::Encoder)?;
                decoder.read_to_end(output).or_raise(|| ErrorKind::InvalidData)?
            },
        };
        tracing::Span::current().record("output_size", size);
        Ok(size)
    }
}
