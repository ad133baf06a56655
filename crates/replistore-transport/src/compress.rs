//! Payload compression for uploaded file content.

use crate::error::{Result, TransportError};

/// Zstd level used by clients when building upload packets.
pub const DEFAULT_LEVEL: i32 = 3;

/// Compress file bytes with zstd at `level` (clamped to 1..=22).
pub fn compress_payload(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::encode_all(data, level.clamp(1, 22)).map_err(|e| TransportError::Compression(e.to_string()))
}

/// Inverse of [`compress_payload`].
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| TransportError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(16);
        let compressed = compress_payload(&data, DEFAULT_LEVEL).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_payload(&compressed).unwrap(), data);
    }

    #[test]
    fn test_empty_input() {
        let compressed = compress_payload(&[], DEFAULT_LEVEL).unwrap();
        assert!(decompress_payload(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let err = decompress_payload(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, TransportError::Compression(_)));
    }

    #[test]
    fn test_level_is_clamped() {
        let compressed = compress_payload(b"hello", 99).unwrap();
        assert_eq!(decompress_payload(&compressed).unwrap(), b"hello");
    }
}
