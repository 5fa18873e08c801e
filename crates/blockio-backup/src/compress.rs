//! Block compression.
//!
//! Blocks and deduped maps are compressed before encryption. An
//! export/import pair must agree on the compression type; it is not
//! recorded in the stored objects.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

/// Supported compression algorithms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// LZ4 with a size-prepended frame; fast, the default
    Lz4,
    /// XZ streams at level 6; denser, slower
    Xz,
}

impl Default for CompressionType {
    fn default() -> Self {
        Self::Lz4
    }
}

impl CompressionType {
    /// Compress a buffer.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Self::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
                encoder
                    .write_all(data)
                    .map_err(|err| BackupError::Compress(err.to_string()))?;
                encoder
                    .finish()
                    .map_err(|err| BackupError::Compress(err.to_string()))
            }
        }
    }

    /// Decompress a buffer produced by [`CompressionType::compress`] with
    /// the same algorithm.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|err| BackupError::Decompress(err.to_string())),
            Self::Xz => {
                let mut decoder = xz2::write::XzDecoder::new(Vec::new());
                decoder
                    .write_all(data)
                    .map_err(|err| BackupError::Decompress(err.to_string()))?;
                decoder
                    .finish()
                    .map_err(|err| BackupError::Decompress(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_both_algorithms() {
        let payloads: [&[u8]; 3] = [b"", b"short", &[7u8; 128 * 1024]];
        for compression in [CompressionType::Lz4, CompressionType::Xz] {
            for payload in payloads {
                let compressed = compression.compress(payload).unwrap();
                let restored = compression.decompress(&compressed).unwrap();
                assert_eq!(restored, payload);
            }
        }
    }

    #[test]
    fn test_garbage_fails_decompression() {
        for compression in [CompressionType::Lz4, CompressionType::Xz] {
            assert!(compression.decompress(b"not compressed data").is_err());
        }
    }

    #[test]
    fn test_algorithms_are_not_interchangeable() {
        let compressed = CompressionType::Lz4.compress(b"payload").unwrap();
        assert!(CompressionType::Xz.decompress(&compressed).is_err());
    }
}
