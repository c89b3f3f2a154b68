//! Local filesystem Cache Middleware (C6).
//!
//! Grounded on `crates/core/src/cache/cas.rs`'s atomic
//! write-then-rename and re-verify-on-load idiom. The object layout
//! itself is flat (`<cache_root>/<10-hex>.tar.gz`), per spec.md §6 —
//! an authoritative external interface, not the teacher's two-level
//! sharded CAS layout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::env_bool_override;
use crate::cache_key::{ToolVersions, compute_cache_key, compute_object_name};
use crate::codec;
use crate::content_hash;
use crate::error::{Error, Result};
use crate::resolver::build_ignore_matcher;
use crate::runner::{Middleware, Next, Outcome, RunContext};
use crate::types::{Artifact, ObjectName};

const DEFAULT_CACHE_DIR_NAME: &str = ".shadowdog-cache";

/// The default local cache root for a project, honoring
/// `SHADOWDOG_LOCAL_CACHE_PATH` the same way the middleware does.
/// Exposed so the RPC Surface's `clear_cache` handler can locate the
/// directory without needing a reference to a live middleware instance.
#[must_use]
pub fn effective_cache_root(configured_root: &Path) -> PathBuf {
    std::env::var("SHADOWDOG_LOCAL_CACHE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| configured_root.to_path_buf())
}

/// The local cache root `LocalCacheMiddleware::new` would use for
/// `project_root`, before any `with_cache_root` override.
#[must_use]
pub fn default_cache_root(project_root: &Path) -> PathBuf {
    effective_cache_root(&project_root.join(DEFAULT_CACHE_DIR_NAME))
}

/// Local-filesystem cache backend: read-before/write-after around the
/// terminal executor, with SHA verification before overwriting an
/// already-correct artifact in place.
pub struct LocalCacheMiddleware {
    read: bool,
    write: bool,
    cache_root: PathBuf,
}

impl LocalCacheMiddleware {
    #[must_use]
    pub fn new(project_root: &Path) -> Self {
        Self {
            read: true,
            write: true,
            cache_root: project_root.join(DEFAULT_CACHE_DIR_NAME),
        }
    }

    #[must_use]
    pub fn with_cache_root(mut self, cache_root: PathBuf) -> Self {
        self.cache_root = cache_root;
        self
    }

    fn effective_cache_root(&self) -> PathBuf {
        effective_cache_root(&self.cache_root)
    }

    fn effective_read(&self) -> bool {
        !env_bool_override("SHADOWDOG_DISABLE_LOCAL_CACHE", false)
            && env_bool_override("SHADOWDOG_LOCAL_CACHE_READ", self.read)
    }

    fn effective_write(&self) -> bool {
        !env_bool_override("SHADOWDOG_DISABLE_LOCAL_CACHE", false)
            && env_bool_override("SHADOWDOG_LOCAL_CACHE_WRITE", self.write)
    }
}

fn object_path(cache_root: &Path, name: &ObjectName) -> PathBuf {
    cache_root.join(format!("{name}.tar.gz"))
}

fn split_output(project_root: &Path, artifact: &Artifact) -> Result<(PathBuf, PathBuf, String)> {
    let full = artifact.output.resolve(project_root);
    let parent = full.parent().map(Path::to_path_buf).unwrap_or_else(|| project_root.to_path_buf());
    let basename = full
        .file_name()
        .ok_or_else(|| Error::config_invalid(format!("artifact output has no file name: {}", artifact.output)))?
        .to_string_lossy()
        .into_owned();
    Ok((full, parent, basename))
}

fn restore_artifact(project_root: &Path, cache_root: &Path, object_name: &ObjectName, artifact: &Artifact) -> Result<()> {
    let archive_path = object_path(cache_root, object_name);
    let archive_bytes = std::fs::read(&archive_path)
        .map_err(|e| Error::io(e, Some(archive_path.clone()), "read cached artifact archive"))?;
    let (full_output, parent, basename) = split_output(project_root, artifact)?;
    let ignore = build_ignore_matcher(&artifact.ignore);

    // Extraction directory is unique per invocation and removed on
    // every exit path via `TempDir`'s drop.
    let temp_dir = tempfile::TempDir::new()
        .map_err(|e| Error::io(e, Some(cache_root.to_path_buf()), "create temp extraction directory"))?;
    codec::unpack(&archive_bytes, temp_dir.path(), &ignore)?;

    let extracted = temp_dir.path().join(&basename);
    let extracted_digest = content_hash::hash_path(&extracted)?;
    let matches_existing = full_output.exists()
        && content_hash::hash_path(&full_output)? == extracted_digest;

    if matches_existing {
        debug!(artifact = %artifact.output, "cached artifact already matches destination, skipping restore");
        return Ok(());
    }

    codec::unpack(&archive_bytes, &parent, &ignore)?;
    Ok(())
}

fn store_artifact(project_root: &Path, cache_root: &Path, object_name: &ObjectName, artifact: &Artifact) -> Result<()> {
    let (full_output, parent, basename) = split_output(project_root, artifact)?;
    if !full_output.exists() {
        debug!(artifact = %artifact.output, "artifact not present, skipping cache store");
        return Ok(());
    }
    let ignore = build_ignore_matcher(&artifact.ignore);
    let archive = codec::pack(&parent, &basename, &ignore)?;

    std::fs::create_dir_all(cache_root)
        .map_err(|e| Error::io(e, Some(cache_root.to_path_buf()), "create local cache directory"))?;
    let archive_path = object_path(cache_root, object_name);
    let tmp_path = cache_root.join(format!(".{object_name}.tar.gz.tmp-{}", std::process::id()));
    std::fs::write(&tmp_path, &archive).map_err(|e| Error::io(e, Some(tmp_path.clone()), "write cache object"))?;
    std::fs::rename(&tmp_path, &archive_path)
        .map_err(|e| Error::io(e, Some(archive_path.clone()), "rename cache object into place"))?;
    Ok(())
}

#[async_trait]
impl Middleware for LocalCacheMiddleware {
    async fn invoke(&self, ctx: &mut RunContext, next: Next<'_>) -> Result<Outcome> {
        let cache_root = self.effective_cache_root();
        let read = self.effective_read();
        let write = self.effective_write();
        let artifacts = ctx.command.artifacts.clone();

        if read && !artifacts.is_empty() {
            let versions = ToolVersions::current();
            let cache_key =
                compute_cache_key(&ctx.project_root, &ctx.files, &ctx.environment_names, &ctx.command.command, &versions)?;
            let object_names: Vec<ObjectName> = artifacts.iter().map(|a| compute_object_name(&cache_key, &a.output)).collect();

            let all_hit = object_names.iter().all(|name| object_path(&cache_root, name).exists());
            if all_hit {
                for (artifact, name) in artifacts.iter().zip(object_names.iter()) {
                    restore_artifact(&ctx.project_root, &cache_root, name, artifact)?;
                }
                return Ok(next.abort(ctx));
            }
        }

        let outcome = next.call(ctx).await?;

        if write && outcome == Outcome::Continue && !artifacts.is_empty() {
            let versions = ToolVersions::current();
            let cache_key =
                compute_cache_key(&ctx.project_root, &ctx.files, &ctx.environment_names, &ctx.command.command, &versions)?;
            for artifact in &artifacts {
                let name = compute_object_name(&cache_key, &artifact.output);
                if let Err(e) = store_artifact(&ctx.project_root, &cache_root, &name, artifact) {
                    warn!(artifact = %artifact.output, error = %e, "failed to store artifact in local cache");
                }
            }
        }

        Ok(outcome)
    }
}
