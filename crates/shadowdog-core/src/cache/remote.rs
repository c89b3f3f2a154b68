//! S3-compatible remote Cache Middleware (C6).
//!
//! Grounded on `crates/aws/src/secrets.rs::AwsResolver` for the
//! credentials-or-graceful-degrade idiom (`aws_config::defaults(...)`,
//! env-var credential probe) and the same read-before/write-after
//! shape as [`super::local::LocalCacheMiddleware`]. Object layout is
//! `<prefix>/<per-artifact name>.tar.gz` (spec.md §4.6).

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::env_bool_override;
use crate::cache_key::{ToolVersions, compute_cache_key, compute_object_name};
use crate::codec;
use crate::content_hash;
use crate::error::{Error, Result};
use crate::resolver::build_ignore_matcher;
use crate::runner::{Middleware, Next, Outcome, RunContext};
use crate::types::{Artifact, ObjectName};

/// S3-compatible cache backend. Credentials are resolved lazily and
/// cached for the lifetime of this middleware instance; if neither a
/// named profile nor explicit env-var credentials are available, every
/// invocation degrades gracefully by skipping both read and write.
pub struct RemoteCacheMiddleware {
    read: bool,
    write: bool,
    bucket: String,
    prefix: String,
    client: OnceCell<Option<Client>>,
}

impl RemoteCacheMiddleware {
    #[must_use]
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            read: true,
            write: true,
            bucket: bucket.into(),
            prefix: prefix.into(),
            client: OnceCell::new(),
        }
    }

    fn effective_bucket(&self) -> String {
        std::env::var("SHADOWDOG_REMOTE_CACHE_BUCKET").unwrap_or_else(|_| self.bucket.clone())
    }

    fn effective_prefix(&self) -> String {
        let base = std::env::var("SHADOWDOG_REMOTE_CACHE_PREFIX").unwrap_or_else(|_| self.prefix.clone());
        match std::env::var("SHADOWDOG_REMOTE_CACHE_EXTRA") {
            Ok(extra) if !extra.is_empty() => format!("{base}/{extra}"),
            _ => base,
        }
    }

    fn effective_read(&self) -> bool {
        !env_bool_override("SHADOWDOG_DISABLE_REMOTE_CACHE", false)
            && env_bool_override("SHADOWDOG_REMOTE_CACHE_READ", self.read)
    }

    fn effective_write(&self) -> bool {
        !env_bool_override("SHADOWDOG_DISABLE_REMOTE_CACHE", false)
            && env_bool_override("SHADOWDOG_REMOTE_CACHE_WRITE", self.write)
    }

    /// A named profile (`AWS_PROFILE`) hands credential resolution to
    /// the SDK's own profile/SSO credential chain; explicit env vars
    /// are the other supported path. Neither present means degrade.
    fn credentials_available() -> bool {
        std::env::var("AWS_PROFILE").is_ok()
            || (std::env::var("AWS_ACCESS_KEY_ID").is_ok() && std::env::var("AWS_SECRET_ACCESS_KEY").is_ok())
    }

    async fn client(&self) -> Option<&Client> {
        self.client
            .get_or_init(|| async {
                if !Self::credentials_available() {
                    return None;
                }
                let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
                Some(Client::new(&config))
            })
            .await
            .as_ref()
    }
}

fn object_key(prefix: &str, name: &ObjectName) -> String {
    format!("{prefix}/{name}.tar.gz")
}

async fn head_exists(client: &Client, bucket: &str, key: &str) -> Result<bool> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                Ok(false)
            } else {
                Err(Error::io(std::io::Error::other(e.to_string()), None, "head s3 object"))
            }
        }
    }
}

async fn get_object_bytes(client: &Client, bucket: &str, key: &str) -> Result<Vec<u8>> {
    let output = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| Error::io(std::io::Error::other(e.to_string()), None, "get s3 object"))?;
    let bytes = output
        .body
        .collect()
        .await
        .map_err(|e| Error::io(std::io::Error::other(e.to_string()), None, "read s3 object body"))?;
    Ok(bytes.into_bytes().to_vec())
}

async fn put_object_bytes(client: &Client, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(ByteStream::from(bytes))
        .send()
        .await
        .map_err(|e| Error::io(std::io::Error::other(e.to_string()), None, "put s3 object"))?;
    Ok(())
}

fn split_output(project_root: &Path, artifact: &Artifact) -> Result<(std::path::PathBuf, std::path::PathBuf, String)> {
    let full = artifact.output.resolve(project_root);
    let parent = full.parent().map(Path::to_path_buf).unwrap_or_else(|| project_root.to_path_buf());
    let basename = full
        .file_name()
        .ok_or_else(|| Error::config_invalid(format!("artifact output has no file name: {}", artifact.output)))?
        .to_string_lossy()
        .into_owned();
    Ok((full, parent, basename))
}

async fn restore_artifact(client: &Client, bucket: &str, project_root: &Path, key: &str, artifact: &Artifact) -> Result<()> {
    let archive_bytes = get_object_bytes(client, bucket, key).await?;
    let (full_output, parent, basename) = split_output(project_root, artifact)?;
    let ignore = build_ignore_matcher(&artifact.ignore);

    let temp_dir = tempfile::TempDir::new()
        .map_err(|e| Error::io(e, None, "create temp extraction directory"))?;
    codec::unpack(&archive_bytes, temp_dir.path(), &ignore)?;

    let extracted = temp_dir.path().join(&basename);
    let extracted_digest = content_hash::hash_path(&extracted)?;
    let matches_existing = full_output.exists() && content_hash::hash_path(&full_output)? == extracted_digest;

    if matches_existing {
        debug!(artifact = %artifact.output, "remote cached artifact already matches destination, skipping restore");
        return Ok(());
    }

    codec::unpack(&archive_bytes, &parent, &ignore)?;
    Ok(())
}

async fn store_artifact(client: &Client, bucket: &str, project_root: &Path, key: &str, artifact: &Artifact) -> Result<()> {
    let (full_output, parent, basename) = split_output(project_root, artifact)?;
    if !full_output.exists() {
        debug!(artifact = %artifact.output, "artifact not present, skipping remote cache store");
        return Ok(());
    }
    let ignore = build_ignore_matcher(&artifact.ignore);
    let archive = codec::pack(&parent, &basename, &ignore)?;
    put_object_bytes(client, bucket, key, archive).await
}

#[async_trait]
impl Middleware for RemoteCacheMiddleware {
    async fn invoke(&self, ctx: &mut RunContext, next: Next<'_>) -> Result<Outcome> {
        let read = self.effective_read();
        let write = self.effective_write();
        let artifacts = ctx.command.artifacts.clone();

        let Some(client) = self.client().await else {
            // No credentials available: degrade gracefully, running
            // the rest of the chain as if this middleware weren't
            // registered.
            return next.call(ctx).await;
        };

        let bucket = self.effective_bucket();
        let prefix = self.effective_prefix();

        if read && !artifacts.is_empty() {
            let versions = ToolVersions::current();
            let cache_key =
                compute_cache_key(&ctx.project_root, &ctx.files, &ctx.environment_names, &ctx.command.command, &versions)?;
            let keys: Vec<String> = artifacts
                .iter()
                .map(|a| object_key(&prefix, &compute_object_name(&cache_key, &a.output)))
                .collect();

            let mut all_hit = true;
            for key in &keys {
                if !head_exists(client, &bucket, key).await? {
                    all_hit = false;
                    break;
                }
            }
            if all_hit {
                for (artifact, key) in artifacts.iter().zip(keys.iter()) {
                    restore_artifact(client, &bucket, &ctx.project_root, key, artifact).await?;
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
                let key = object_key(&prefix, &compute_object_name(&cache_key, &artifact.output));
                if let Err(e) = store_artifact(client, &bucket, &ctx.project_root, &key, artifact).await {
                    warn!(artifact = %artifact.output, error = %e, "failed to store artifact in remote cache");
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_joins_prefix_and_name() {
        let key = object_key("shadowdog", &ObjectName::from_hex("abcdef0123".to_string()));
        assert_eq!(key, "shadowdog/abcdef0123.tar.gz");
    }

    #[test]
    fn credentials_available_requires_profile_or_full_key_pair() {
        // SAFETY: serialized by the test harness's single-threaded env access per test binary is not
        // guaranteed across the crate, so this asserts structure rather than mutating global env state.
        let profile_only = std::env::var("AWS_PROFILE").is_ok();
        let keys_present =
            std::env::var("AWS_ACCESS_KEY_ID").is_ok() && std::env::var("AWS_SECRET_ACCESS_KEY").is_ok();
        assert_eq!(
            RemoteCacheMiddleware::credentials_available(),
            profile_only || keys_present
        );
    }
}
