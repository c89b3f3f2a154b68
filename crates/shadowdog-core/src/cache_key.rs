//! Cache Key (C1): a pure, total digest over ordered inputs.
//!
//! Grounded on `crates/core/src/cache/tasks.rs::compute_cache_key` and
//! `crates/core/src/cache/cas.rs::BlobId`'s hex-digest-newtype idiom,
//! generalized to the ordered-input list spec.md §4.1 specifies.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{CacheKey, ObjectName, RelativePath};

/// Domain separator fed into the hasher first. Gives key stability
/// across unrelated uses of SHA-256 in this crate without being a
/// secret in its own right — the cache key's actual sensitivity to
/// the tool/runtime versions comes from those values being hashed in,
/// not from this constant.
const DOMAIN_SEPARATOR: &[u8] = b"shadowdog-cache-key-v1";

/// The tool and runtime version strings mixed into every cache key,
/// per spec.md §3/§4.1.
#[derive(Debug, Clone)]
pub struct ToolVersions {
    pub tool_version: String,
    pub runtime_version: String,
}

impl ToolVersions {
    #[must_use]
    pub fn current() -> Self {
        Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_version: rustc_version_string(),
        }
    }
}

fn rustc_version_string() -> String {
    // No `rustc` introspection crate exists in the teacher corpus; the
    // target OS/arch pair is a stable, always-available proxy for
    // "host language-runtime version" without adding a new
    // dependency.
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Compute the cache key for a Command: a keyed digest over, in
/// order, each resolved input path followed by its contents, each
/// invalidator environment variable's current value (empty string if
/// unset), the command string, the tool version, and the runtime
/// version. Truncated to 10 hex characters.
///
/// A missing input file is fatal here (spec.md §4.1): callers doing a
/// watch-mode initial scan must resolve with `preserve_nonexistent`
/// and exclude files that don't exist from this call, applying the
/// same policy to the manifest write.
pub fn compute_cache_key(
    project_root: &Path,
    files: &[RelativePath],
    environment_names: &[String],
    command: &str,
    versions: &ToolVersions,
) -> Result<CacheKey> {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_SEPARATOR);

    for file in files {
        hasher.update(file.to_string_lossy().as_bytes());
        let absolute = file.resolve(project_root);
        let contents = std::fs::read(&absolute)
            .map_err(|_| Error::cache_key_input(file.to_string_lossy()))?;
        hasher.update(&contents);
    }

    for name in environment_names {
        let value = std::env::var(name).unwrap_or_default();
        hasher.update(value.as_bytes());
    }

    hasher.update(command.as_bytes());
    hasher.update(versions.tool_version.as_bytes());
    hasher.update(versions.runtime_version.as_bytes());

    let digest = hasher.finalize();
    let hex = hex::encode(digest);
    Ok(CacheKey::from_hex(hex[..10].to_string()))
}

/// Per-artifact object name: a second digest over (cache key, output
/// path).
#[must_use]
pub fn compute_object_name(cache_key: &CacheKey, output: &RelativePath) -> ObjectName {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_SEPARATOR);
    hasher.update(cache_key.as_str().as_bytes());
    hasher.update(output.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(digest);
    ObjectName::from_hex(hex[..10].to_string())
}
