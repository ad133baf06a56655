//! Directory archives exchanged during catch-up.
//!
//! A cacheup response is a deflate-compressed zip of a directory tree. Extraction parses
//! and inflates every entry before touching the target, so a corrupt archive leaves the
//! receiver unchanged. Existing files are overwritten, which makes replaying the same
//! archive idempotent.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{StorageError, StorageResult};

/// Outcome of unpacking an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Regular files written.
    pub files: usize,
    /// Directories created.
    pub dirs: usize,
    /// Payload bytes written.
    pub bytes: u64,
}

/// Archive the contents of `dir` (paths relative to `dir`).
pub fn archive_dir(dir: &Path) -> StorageResult<Vec<u8>> {
    let mut entries = Vec::new();
    collect(dir, dir, &mut entries)?;
    entries.sort();

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, is_dir) in &entries {
        if *is_dir {
            zip.add_directory(name.as_str(), options)?;
        } else {
            zip.start_file(name.as_str(), options)?;
            let data = std::fs::read(dir.join(name))?;
            zip.write_all(&data)?;
        }
    }
    let bytes = zip.finish()?.into_inner();
    debug!(dir = %dir.display(), entries = entries.len(), bytes = bytes.len(), "directory archived");
    Ok(bytes)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<(String, bool)>) -> StorageResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|e| StorageError::Archive(e.to_string()))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type()?.is_dir() {
            out.push((name, true));
            collect(root, &path, out)?;
        } else {
            out.push((name, false));
        }
    }
    Ok(())
}

/// Unpack `bytes` into `target`, overwriting files that already exist.
pub fn extract_archive(bytes: &[u8], target: &Path) -> StorageResult<ExtractStats> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut files: Vec<(PathBuf, Vec<u8>)> = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let rel = file
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| StorageError::InvalidPath {
                path: file.name().to_string(),
            })?;
        if file.is_dir() {
            dirs.push(rel);
        } else {
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            files.push((rel, data));
        }
    }

    let mut stats = ExtractStats::default();
    std::fs::create_dir_all(target)?;
    for dir in dirs {
        std::fs::create_dir_all(target.join(dir))?;
        stats.dirs += 1;
    }
    for (rel, data) in files {
        let path = target.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &data)?;
        stats.files += 1;
        stats.bytes += data.len() as u64;
    }
    debug!(target = %target.display(), files = stats.files, "archive extracted");
    Ok(stats)
}

/// [`archive_dir`] on the blocking pool.
pub async fn archive_dir_async(dir: PathBuf) -> StorageResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || archive_dir(&dir))
        .await
        .map_err(|e| StorageError::Archive(e.to_string()))?
}

/// [`extract_archive`] on the blocking pool.
pub async fn extract_archive_async(bytes: Vec<u8>, target: PathBuf) -> StorageResult<ExtractStats> {
    tokio::task::spawn_blocking(move || extract_archive(&bytes, &target))
        .await
        .map_err(|e| StorageError::Archive(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut entries = Vec::new();
        collect(dir, dir, &mut entries).unwrap();
        entries
            .into_iter()
            .filter(|(_, is_dir)| !is_dir)
            .map(|(name, _)| {
                let data = std::fs::read(dir.join(&name)).unwrap();
                (name, data)
            })
            .collect()
    }

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join("aaaaa/bbbbb")).unwrap();
        std::fs::create_dir_all(dir.join("ccccc/empty")).unwrap();
        std::fs::write(dir.join("aaaaa/bbbbb/v1"), b"first version").unwrap();
        std::fs::write(dir.join("aaaaa/bbbbb/v2"), b"second version").unwrap();
        std::fs::write(dir.join("top"), b"top level").unwrap();
    }

    #[test]
    fn test_archive_extract_reproduces_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let target = tmp.path().join("target");
        populate(&source);

        let bytes = archive_dir(&source).unwrap();
        let stats = extract_archive(&bytes, &target).unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(snapshot(&source), snapshot(&target));
        assert!(target.join("ccccc/empty").is_dir());
    }

    #[test]
    fn test_extract_twice_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let target = tmp.path().join("target");
        populate(&source);
        let bytes = archive_dir(&source).unwrap();

        extract_archive(&bytes, &target).unwrap();
        let first = snapshot(&target);
        extract_archive(&bytes, &target).unwrap();
        assert_eq!(first, snapshot(&target));
    }

    #[test]
    fn test_extract_overwrites_and_keeps_unrelated_files() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let target = tmp.path().join("target");
        populate(&source);
        std::fs::create_dir_all(target.join("aaaaa/bbbbb")).unwrap();
        std::fs::write(target.join("aaaaa/bbbbb/v1"), b"stale").unwrap();
        std::fs::write(target.join("local-only"), b"mine").unwrap();

        extract_archive(&archive_dir(&source).unwrap(), &target).unwrap();

        assert_eq!(std::fs::read(target.join("aaaaa/bbbbb/v1")).unwrap(), b"first version");
        assert_eq!(std::fs::read(target.join("local-only")).unwrap(), b"mine");
    }

    #[test]
    fn test_empty_directory_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("empty");
        std::fs::create_dir_all(&source).unwrap();
        let bytes = archive_dir(&source).unwrap();
        let stats = extract_archive(&bytes, &tmp.path().join("out")).unwrap();
        assert_eq!(stats, ExtractStats::default());
    }

    #[test]
    fn test_corrupt_archive_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("target");
        let err = extract_archive(b"not a zip archive at all", &target).unwrap_err();
        assert!(matches!(err, StorageError::Archive(_)));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_async_wrappers() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        populate(&source);
        let bytes = archive_dir_async(source.clone()).await.unwrap();
        let stats = extract_archive_async(bytes, tmp.path().join("target")).await.unwrap();
        assert_eq!(stats.files, 3);
    }
}
