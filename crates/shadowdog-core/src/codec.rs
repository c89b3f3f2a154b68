//! Artifact Codec (C3): pack/unpack an output path to a single
//! gzip-framed tar stream with a per-entry filter (spec.md §4.3).
//!
//! Grounded on the teacher's `tar` + `flate2` dependencies (used for
//! workspace snapshot tarballs in
//! `crates/core/src/cache/tasks.rs::save_result`) and the
//! atomic-write-then-rename idiom from
//! `crates/core/src/cache/cas.rs::store`.

use std::io::Read;
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

/// Per-entry predicate: return `true` to skip (ignore) an entry when
/// packing or unpacking.
pub type IgnoreFilter<'a> = dyn Fn(&Path) -> bool + 'a;

/// Pack `root/basename` into a gzip-framed tar archive whose single
/// top-level entry is `basename`. Errors propagate; nothing partial is
/// ever handed back to the caller (the in-memory buffer is only
/// returned once both the tar builder and the gzip encoder have
/// finished successfully).
pub fn pack(root: &Path, basename: &str, ignore: &IgnoreFilter<'_>) -> Result<Vec<u8>> {
    let source = root.join(basename);
    let metadata = std::fs::symlink_metadata(&source)
        .map_err(|e| Error::io(e, Some(source.clone()), "stat artifact for packing"))?;

    let mut buffer = Vec::new();
    {
        let encoder = GzEncoder::new(&mut buffer, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        if metadata.is_dir() {
            append_dir_filtered(&mut builder, &source, basename, ignore)?;
        } else {
            if !ignore(Path::new(basename)) {
                builder
                    .append_path_with_name(&source, basename)
                    .map_err(|e| Error::io(e, Some(source.clone()), "append artifact to archive"))?;
            }
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| Error::io(e, Some(source.clone()), "finish tar builder"))?;
        encoder
            .finish()
            .map_err(|e| Error::io(e, Some(source.clone()), "finish gzip encoder"))?;
    }
    Ok(buffer)
}

fn append_dir_filtered<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    source_root: &Path,
    basename: &str,
    ignore: &IgnoreFilter<'_>,
) -> Result<()> {
    for entry in walk(source_root) {
        let entry = entry?;
        let relative = entry
            .strip_prefix(source_root)
            .expect("walked entry is under source_root");
        let member_path = Path::new(basename).join(relative);
        if ignore(&member_path) {
            continue;
        }
        if entry.is_dir() {
            continue;
        }
        builder
            .append_path_with_name(&entry, &member_path)
            .map_err(|e| Error::io(e, Some(entry.clone()), "append entry to archive"))?;
    }
    Ok(())
}

fn walk(root: &Path) -> Vec<Result<std::path::PathBuf>> {
    let mut stack = vec![root.to_path_buf()];
    let mut out = Vec::new();
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                out.push(Err(Error::io(e, Some(dir.clone()), "read directory for packing")));
                continue;
            }
        };
        for entry in entries {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path.clone());
                    }
                    out.push(Ok(path));
                }
                Err(e) => out.push(Err(Error::io(e, Some(dir.clone()), "read directory entry"))),
            }
        }
    }
    out
}

/// Unpack a gzip-framed tar stream into `dest/<basename>`, creating
/// intermediate directories as needed. Filtered-out entries (per
/// `ignore`) are skipped.
pub fn unpack(archive: &[u8], dest: &Path, ignore: &IgnoreFilter<'_>) -> Result<()> {
    let decoder = GzDecoder::new(archive);
    let mut tar_archive = tar::Archive::new(decoder);

    std::fs::create_dir_all(dest).map_err(|e| Error::io(e, Some(dest.to_path_buf()), "create destination directory"))?;

    let entries = tar_archive
        .entries()
        .map_err(|e| Error::io(e, Some(dest.to_path_buf()), "read tar entries"))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::io(e, Some(dest.to_path_buf()), "read tar entry"))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::io(e, Some(dest.to_path_buf()), "read tar entry path"))?
            .into_owned();
        if ignore(&entry_path) {
            continue;
        }
        let target = dest.join(&entry_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(e, Some(parent.to_path_buf()), "create intermediate directory"))?;
        }
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| Error::io(e, Some(target.clone()), "create directory entry"))?;
            continue;
        }
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| Error::io(e, Some(target.clone()), "read tar entry contents"))?;
        std::fs::write(&target, contents)
            .map_err(|e| Error::io(e, Some(target.clone()), "write unpacked entry"))?;
    }
    Ok(())
}
