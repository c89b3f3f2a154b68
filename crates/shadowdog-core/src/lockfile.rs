//! Lock File Writer (C11): a durable, deterministic artifact manifest
//! rebuilt from live configuration and execution-time tracking state
//! (spec.md §4.11).
//!
//! Grounded on `crates/core/src/lockfile/mod.rs::Lockfile` — the
//! struct-wrapping-`Vec` shape and `load`/`save`/upsert-by-identity
//! idiom transfer directly even though the serialization format (JSON
//! here vs. TOML there) and the record domain (build artifacts vs. OCI
//! provenance) differ. Unlike the teacher's lockfile, which is loaded
//! once and mutated incrementally, this one is always rebuilt in full
//! from the Config plus in-memory execution-time tracking, since
//! spec.md §4.11 defines the rebuild as "fully deterministic" rather
//! than a merge.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::ser::{PrettyFormatter, Serializer as JsonSerializer};
use tokio::sync::Mutex as AsyncMutex;

use crate::cache_key::{self, ToolVersions};
use crate::config::Config;
use crate::content_hash;
use crate::error::Result;
use crate::resolver;
use shadowdog_events::{Emission, EventBus, ShadowdogEvent};

const LOCKFILE_VERSION: u32 = 1;

/// Cache key sentinel written when a watched input has gone missing
/// between generation and lock-file rebuild, so one unreadable file
/// does not abort the whole rebuild.
const CACHE_KEY_UNAVAILABLE: &str = "unavailable";

/// Top-level lock file document (spec.md §3 "Lock file").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lockfile {
    pub version: u32,
    pub artifacts: Vec<LockedArtifact>,
}

/// One artifact record, in configuration-declared order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockedArtifact {
    pub output: String,
    #[serde(rename = "contentDigest")]
    pub content_digest: String,
    #[serde(rename = "cacheKey")]
    pub cache_key: String,
    #[serde(rename = "executionTimeMs")]
    pub execution_time_ms: u64,
    pub manifest: FileManifest,
}

/// The watched file list, obfuscated environment values, and command
/// string behind one artifact's cache key (spec.md §4.11).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileManifest {
    pub command: String,
    pub files: Vec<String>,
    pub environment: Vec<EnvEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
}

/// Obfuscate an environment value as "first 2 chars + stars + last 2
/// chars" (spec.md §4.11). Short values are fully starred rather than
/// leaking their whole content through the boundary.
fn obfuscate(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    let stars = "*".repeat(chars.len() - 4);
    format!("{head}{stars}{tail}")
}

#[derive(Default)]
struct TrackingState {
    config: Option<Config>,
    begin_times: HashMap<String, DateTime<Utc>>,
    execution_times_ms: HashMap<String, u64>,
    past_initial_phase: bool,
}

/// Subscribes to the Event Bus and keeps `lock_file_path` in sync with
/// the live configuration and execution-time tracking state. Cheap to
/// clone-by-`Arc`; a single instance is shared for the daemon's
/// lifetime.
pub struct LockWriter {
    project_root: PathBuf,
    lock_file_path: PathBuf,
    state: StdMutex<TrackingState>,
    write_lock: AsyncMutex<()>,
}

impl LockWriter {
    #[must_use]
    pub fn new(project_root: PathBuf, lock_file_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            project_root,
            lock_file_path,
            state: StdMutex::new(TrackingState::default()),
            write_lock: AsyncMutex::new(()),
        })
    }

    /// Register this writer on `event_bus`. Event subscribers run
    /// synchronously on the emitting thread, so tracking updates
    /// happen in-line but the (possibly slow) file rewrite is handed
    /// off to a spawned task; `write_lock` keeps at most one rewrite in
    /// flight, matching spec.md §5's ordering guarantee.
    pub fn install(writer: Arc<Self>, event_bus: &EventBus) {
        event_bus.subscribe(move |emission: &Emission| {
            if writer.record(emission) {
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    if let Err(e) = writer.rebuild_and_write().await {
                        tracing::error!(error = %e, "lock file rebuild failed");
                    }
                });
            }
        });
    }

    /// Update in-memory tracking state for one emission. Returns
    /// whether it should trigger a rebuild.
    fn record(&self, emission: &Emission) -> bool {
        match &emission.event {
            ShadowdogEvent::ConfigLoaded { config } => {
                self.on_config_loaded(config);
                false
            }
            ShadowdogEvent::Begin { artifacts } => {
                self.on_begin(artifacts, emission.emitted_at);
                false
            }
            ShadowdogEvent::End { artifacts } => self.on_end(artifacts, emission.emitted_at),
            ShadowdogEvent::AllTasksComplete => {
                let mut state = self.state.lock().expect("lock writer state poisoned");
                state.past_initial_phase = true;
                true
            }
            _ => false,
        }
    }

    fn on_config_loaded(&self, config_value: &serde_json::Value) {
        match serde_json::from_value::<Config>(config_value.clone()) {
            Ok(config) => {
                self.state.lock().expect("lock writer state poisoned").config = Some(config);
            }
            Err(e) => tracing::warn!(error = %e, "lock file writer could not parse configLoaded payload"),
        }
    }

    fn on_begin(&self, artifacts: &[String], at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("lock writer state poisoned");
        for artifact in artifacts {
            state.begin_times.insert(artifact.clone(), at);
        }
    }

    /// Returns whether this `end` should trigger a rebuild: spec.md
    /// §4.11 rebuilds after every `end` once past the initial generate
    /// phase, and always after `allTasksComplete`.
    fn on_end(&self, artifacts: &[String], at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().expect("lock writer state poisoned");
        for artifact in artifacts {
            if let Some(begin) = state.begin_times.remove(artifact) {
                let elapsed = (at - begin).num_milliseconds().max(0) as u64;
                state.execution_times_ms.insert(artifact.clone(), elapsed);
            }
        }
        state.past_initial_phase
    }

    /// Rebuild the lock file from live state and write it, serialized
    /// against any other in-flight rewrite.
    async fn rebuild_and_write(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.warn_if_existing_file_is_unusable();
        let lockfile = self.build_lockfile();
        self.write(&lockfile)
    }

    /// Detect merge-conflict markers or invalid JSON in the file
    /// currently on disk, purely to log the condition spec.md §4.11
    /// calls out — the rebuild below always overwrites with a fresh
    /// deterministic document regardless of what was found.
    fn warn_if_existing_file_is_unusable(&self) {
        let Ok(text) = std::fs::read_to_string(&self.lock_file_path) else {
            return;
        };
        if has_merge_conflict_markers(&text) {
            tracing::warn!(path = %self.lock_file_path.display(), "existing lock file has merge-conflict markers, rewriting from scratch");
        } else if serde_json::from_str::<serde_json::Value>(&text).is_err() {
            tracing::warn!(path = %self.lock_file_path.display(), "existing lock file is not valid JSON, rewriting from scratch");
        }
    }

    /// Walk the configuration in its declared order and produce one
    /// record per artifact (spec.md §4.11). A Command whose cache key
    /// can't be computed (e.g. a watched file vanished) still gets a
    /// record, with `CACHE_KEY_UNAVAILABLE` in place of a real key,
    /// rather than aborting the whole rebuild.
    fn build_lockfile(&self) -> Lockfile {
        let (config, execution_times_ms) = {
            let state = self.state.lock().expect("lock writer state poisoned");
            (state.config.clone(), state.execution_times_ms.clone())
        };
        let Some(config) = config else {
            return Lockfile { version: LOCKFILE_VERSION, artifacts: Vec::new() };
        };

        let versions = ToolVersions::current();
        let mut artifacts = Vec::new();

        for watcher in &config.watchers {
            if !watcher.enabled {
                continue;
            }
            let mut ignores = watcher.ignored.clone();
            ignores.extend(config.default_ignored_files.iter().cloned());

            let files = resolver::resolve(&self.project_root, &watcher.files, &ignores, true, false)
                .unwrap_or_default();
            let invalidator_files =
                resolver::resolve(&self.project_root, &watcher.invalidators.files, &ignores, true, false)
                    .unwrap_or_default();
            let mut all_files = files;
            all_files.extend(invalidator_files);

            for command in &watcher.commands {
                let cache_key = cache_key::compute_cache_key(
                    &self.project_root,
                    &all_files,
                    &watcher.invalidators.environment,
                    &command.command,
                    &versions,
                )
                .map(|k| k.as_str().to_string())
                .unwrap_or_else(|e| {
                    tracing::warn!(command = %command.command, error = %e, "could not compute cache key for lock file record");
                    CACHE_KEY_UNAVAILABLE.to_string()
                });

                let manifest = FileManifest {
                    command: command.command.clone(),
                    files: all_files.iter().map(|f| f.to_string_lossy()).collect(),
                    environment: environment_entries(&watcher.invalidators.environment),
                };

                for artifact in &command.artifacts {
                    let output_str = artifact.output.to_string_lossy();
                    let full_path = artifact.output.resolve(&self.project_root);
                    let content_digest = content_hash::hash_path_or_sentinel(&full_path)
                        .unwrap_or_else(|_| content_hash::NOT_FOUND_SENTINEL.to_string());
                    let execution_time_ms = execution_times_ms.get(&output_str).copied().unwrap_or(0);

                    artifacts.push(LockedArtifact {
                        output: output_str,
                        content_digest,
                        cache_key: cache_key.clone(),
                        execution_time_ms,
                        manifest: manifest.clone(),
                    });
                }
            }
        }

        Lockfile { version: LOCKFILE_VERSION, artifacts }
    }

    fn write(&self, lockfile: &Lockfile) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"  ");
        let mut ser = JsonSerializer::with_formatter(&mut buf, formatter);
        lockfile
            .serialize(&mut ser)
            .map_err(|e| crate::error::Error::config_invalid(format!("failed to serialize lock file: {e}")))?;
        buf.push(b'\n');
        std::fs::write(&self.lock_file_path, &buf)
            .map_err(|e| crate::error::Error::io(e, Some(self.lock_file_path.clone()), "write lock file"))
    }
}

fn environment_entries(names: &[String]) -> Vec<EnvEntry> {
    names
        .iter()
        .map(|name| EnvEntry {
            name: name.clone(),
            value: obfuscate(&std::env::var(name).unwrap_or_default()),
        })
        .collect()
}

fn has_merge_conflict_markers(text: &str) -> bool {
    text.lines().any(|line| {
        line.starts_with("<<<<<<<") || line.starts_with("=======") || line.starts_with(">>>>>>>")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Artifact, Command, Invalidators, RelativePath, Watcher};
    use tempfile::TempDir;

    fn config_with_one_command(output: &str) -> Config {
        Config {
            schema: None,
            debounce_time_ms: 2000,
            default_ignored_files: vec![],
            plugins: vec![],
            watchers: vec![Watcher {
                enabled: true,
                files: vec![],
                invalidators: Invalidators::default(),
                ignored: vec![],
                label: None,
                commands: vec![Command {
                    command: "build".to_string(),
                    working_directory: RelativePath::new(".").unwrap(),
                    tags: Default::default(),
                    artifacts: vec![Artifact {
                        output: RelativePath::new(output).unwrap(),
                        description: None,
                        ignore: vec![],
                    }],
                }],
            }],
        }
    }

    #[test]
    fn obfuscate_masks_middle_keeping_two_chars_each_end() {
        assert_eq!(obfuscate("secretvalue"), "se*******ue");
    }

    #[test]
    fn obfuscate_stars_out_short_values_entirely() {
        assert_eq!(obfuscate("abcd"), "****");
        assert_eq!(obfuscate(""), "");
    }

    #[test]
    fn merge_conflict_markers_are_detected_at_line_start() {
        assert!(has_merge_conflict_markers("a\n<<<<<<< HEAD\nb\n=======\nc\n>>>>>>> main\n"));
        assert!(!has_merge_conflict_markers("{\"version\": 1}"));
    }

    #[tokio::test]
    async fn rebuild_after_all_tasks_complete_writes_one_record_per_artifact() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("out.txt"), "built").unwrap();
        let lock_path = project.path().join("shadowdog.lock.json");

        let writer = LockWriter::new(project.path().to_path_buf(), lock_path.clone());
        let config = config_with_one_command("out.txt");
        writer.state.lock().unwrap().config = Some(config);

        writer.record(&Emission {
            id: uuid::Uuid::new_v4(),
            emitted_at: Utc::now(),
            event: ShadowdogEvent::AllTasksComplete,
        });
        writer.rebuild_and_write().await.unwrap();

        let text = std::fs::read_to_string(&lock_path).unwrap();
        let parsed: Lockfile = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.artifacts.len(), 1);
        assert_eq!(parsed.artifacts[0].output, "out.txt");
        assert_ne!(parsed.artifacts[0].content_digest, content_hash::NOT_FOUND_SENTINEL);
        assert!(text.ends_with('\n'));
        assert!(text.contains("  \""), "expected two-space indentation");
    }

    #[tokio::test]
    async fn missing_artifact_gets_not_found_sentinel() {
        let project = TempDir::new().unwrap();
        let lock_path = project.path().join("shadowdog.lock.json");
        let writer = LockWriter::new(project.path().to_path_buf(), lock_path.clone());
        writer.state.lock().unwrap().config = Some(config_with_one_command("never-built.txt"));

        writer.rebuild_and_write().await.unwrap();

        let parsed: Lockfile = serde_json::from_str(&std::fs::read_to_string(&lock_path).unwrap()).unwrap();
        assert_eq!(parsed.artifacts[0].content_digest, content_hash::NOT_FOUND_SENTINEL);
    }

    #[test]
    fn execution_time_is_tracked_from_matching_begin_and_end() {
        let project = TempDir::new().unwrap();
        let lock_path = project.path().join("shadowdog.lock.json");
        let writer = LockWriter::new(project.path().to_path_buf(), lock_path);

        let begin_at = Utc::now();
        writer.on_begin(&["out.txt".to_string()], begin_at);
        let end_at = begin_at + chrono::Duration::milliseconds(42);
        writer.on_end(&["out.txt".to_string()], end_at);

        let elapsed = *writer.state.lock().unwrap().execution_times_ms.get("out.txt").unwrap();
        assert_eq!(elapsed, 42);
    }

    #[test]
    fn corrupt_existing_file_is_only_logged_not_fatal() {
        let project = TempDir::new().unwrap();
        let lock_path = project.path().join("shadowdog.lock.json");
        std::fs::write(&lock_path, "<<<<<<< HEAD\nnot json\n").unwrap();
        let writer = LockWriter::new(project.path().to_path_buf(), lock_path);
        writer.warn_if_existing_file_is_unusable();
    }
}
