//! Content addressing: SHA-1 digests split into fixed-width directory shards.
//!
//! An upload is addressed twice. The logical key `<dir>/<name without extension>` gives
//! a per-file digest shared by every version of that file; hashing
//! `<owner email>/<that digest>` then gives the owner-scoped address whose sharded path
//! becomes the blob directory on every replica.

use std::path::Path;

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

/// Hex characters per directory shard.
pub const BLOCK_SIZE: usize = 5;

/// Separator between shards in [`PathKey::sharded_path`].
pub const SHARD_SEPARATOR: &str = "/";

/// A hashed storage address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    /// Hex digest split into [`BLOCK_SIZE`] blocks joined by [`SHARD_SEPARATOR`].
    pub sharded_path: String,
    /// The full hex digest.
    pub digest: String,
}

/// SHA-1 `key`, hex encode it and split it into 5-character shards.
///
/// A trailing remainder shorter than [`BLOCK_SIZE`] is dropped from the sharded path.
pub fn hash_path(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));
    let shards: Vec<&str> = digest
        .as_bytes()
        .chunks_exact(BLOCK_SIZE)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();
    PathKey {
        sharded_path: shards.join(SHARD_SEPARATOR),
        digest,
    }
}

/// Logical key of a file: its directory joined with the file name minus extension.
pub fn logical_key(dir: &str, file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        stem
    } else {
        format!("{dir}/{stem}")
    }
}

/// Owner-scoped address of a logical file.
pub fn upload_address(email: &str, dir: &str, file_name: &str) -> PathKey {
    let file_key = hash_path(&logical_key(dir, file_name));
    hash_path(&format!("{email}/{}", file_key.digest))
}

/// Blob name of one version: UTC timestamp prefix plus the address digest.
pub fn version_hash(address: &PathKey, at: DateTime<Utc>) -> String {
    format!("{}_{}", at.format("%Y%m%d%H%M%S"), address.digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_known_digest() {
        let key = hash_path("abc");
        assert_eq!(key.digest, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            key.sharded_path,
            "a9993/e3647/06816/aba3e/25717/850c2/6c9cd/0d89d"
        );
    }

    #[test]
    fn test_sha1_hex_has_eight_shards() {
        let key = hash_path("/docs/report");
        assert_eq!(key.digest.len(), 40);
        assert_eq!(key.sharded_path.split('/').count(), 8);
    }

    #[test]
    fn test_logical_key_strips_extension() {
        assert_eq!(logical_key("/docs", "report.pdf"), "/docs/report");
        assert_eq!(logical_key("/docs/", "report.pdf"), "/docs/report");
        assert_eq!(logical_key("", "Makefile"), "Makefile");
        assert_eq!(logical_key("/home", "archive.tar.gz"), "/home/archive.tar");
    }

    #[test]
    fn test_versions_share_address() {
        let a = upload_address("a@x.com", "/docs", "report.pdf");
        let b = upload_address("a@x.com", "/docs", "report.docx");
        assert_eq!(a, b);
    }

    #[test]
    fn test_address_is_owner_scoped() {
        let a = upload_address("a@x.com", "/docs", "report.pdf");
        let b = upload_address("b@x.com", "/docs", "report.pdf");
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_version_hash_prefix() {
        let address = hash_path("k");
        let at = Utc.with_ymd_and_hms(2024, 1, 3, 9, 5, 7).unwrap();
        assert_eq!(
            version_hash(&address, at),
            format!("20240103090507_{}", address.digest)
        );
    }

    proptest! {
        #[test]
        fn prop_shards_are_truncated_digest_prefix(key in ".{0,64}") {
            let a = hash_path(&key);
            let b = hash_path(&key);
            prop_assert_eq!(&a, &b);

            let joined: String = a.sharded_path.split(SHARD_SEPARATOR).collect();
            let expected_len = a.digest.len() / BLOCK_SIZE * BLOCK_SIZE;
            prop_assert_eq!(joined.len(), expected_len);
            prop_assert!(a.digest.starts_with(&joined));
            for shard in a.sharded_path.split(SHARD_SEPARATOR) {
                prop_assert_eq!(shard.len(), BLOCK_SIZE);
            }
        }
    }
}
