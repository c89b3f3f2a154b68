//! Deterministic content hashing shared by the Cache Middlewares' SHA
//! verification step (C6) and the Lock File Writer's content digest
//! field (C11).
//!
//! Walks directory trees in lexicographic order of their relative
//! paths before hashing, matching the File Resolver's own ordering
//! discipline so the digest of a directory tree is independent of
//! readdir order.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// How many leading hex characters of the full SHA-256 digest count as
/// "short" for lock-file and log-line display. Not specified exactly
/// by the external interface; 16 hex chars (8 bytes) keeps collision
/// probability negligible for a build-artifact manifest while staying
/// terse.
pub const SHORT_DIGEST_LEN: usize = 16;

/// Sentinel written in place of a content digest when an artifact is
/// absent (spec.md §3 Lock file).
pub const NOT_FOUND_SENTINEL: &str = "not-found";

/// Full (64 hex char) content digest of a file or directory tree.
pub fn hash_path(path: &Path) -> Result<String> {
    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| Error::io(e, Some(path.to_path_buf()), "stat for content hash"))?;
    let mut hasher = Sha256::new();
    if metadata.is_dir() {
        let mut entries = collect_files(path)?;
        entries.sort();
        for relative in entries {
            hasher.update(relative.to_string_lossy().as_bytes());
            let bytes = std::fs::read(path.join(&relative))
                .map_err(|e| Error::io(e, Some(path.join(&relative)), "read for content hash"))?;
            hasher.update(&bytes);
        }
    } else {
        let bytes = std::fs::read(path).map_err(|e| Error::io(e, Some(path.to_path_buf()), "read for content hash"))?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Short (16 hex char) content digest, or the "not-found" sentinel if
/// `path` does not exist.
pub fn hash_path_or_sentinel(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(NOT_FOUND_SENTINEL.to_string());
    }
    let full = hash_path(path)?;
    Ok(full[..SHORT_DIGEST_LEN].to_string())
}

fn collect_files(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::io(e, Some(dir.clone()), "read directory for content hash"))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(e, Some(dir.clone()), "read directory entry"))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path.strip_prefix(root).unwrap_or(&path).to_path_buf());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn identical_file_contents_hash_identically() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("b.txt"), "hello").unwrap();
        let a = hash_path(&dir.path().join("a.txt")).unwrap();
        let b = hash_path(&dir.path().join("b.txt")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn directory_hash_is_independent_of_readdir_order() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        std::fs::write(dir.path().join("dist/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("dist/b.txt"), "b").unwrap();
        let one = hash_path(&dir.path().join("dist")).unwrap();

        let dir2 = TempDir::new().unwrap();
        std::fs::create_dir_all(dir2.path().join("dist")).unwrap();
        // write in reverse order
        std::fs::write(dir2.path().join("dist/b.txt"), "b").unwrap();
        std::fs::write(dir2.path().join("dist/a.txt"), "a").unwrap();
        let two = hash_path(&dir2.path().join("dist")).unwrap();

        assert_eq!(one, two);
    }

    #[test]
    fn missing_path_yields_sentinel() {
        let dir = TempDir::new().unwrap();
        let digest = hash_path_or_sentinel(&dir.path().join("nope.txt")).unwrap();
        assert_eq!(digest, NOT_FOUND_SENTINEL);
    }

    #[test]
    fn present_path_yields_short_digest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let digest = hash_path_or_sentinel(&dir.path().join("a.txt")).unwrap();
        assert_eq!(digest.len(), SHORT_DIGEST_LEN);
    }
}
