//! Core data model (spec.md §3).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A path that is always relative to the project root. Never absolute
/// in persisted state (spec.md §3 Artifact invariant).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_absolute() {
            return Err(Error::config_invalid(format!(
                "path must be relative to the project root: {}",
                path.display()
            )));
        }
        if path.components().any(|c| c == std::path::Component::ParentDir) {
            return Err(Error::config_invalid(format!(
                "path must not escape the project root via '..': {}",
                path.display()
            )));
        }
        Ok(Self(path))
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }

    #[must_use]
    pub fn resolve(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.0)
    }
}

impl std::fmt::Display for RelativePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

/// Output path (file or directory subtree) produced by a Command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    pub output: RelativePath,
    #[serde(default)]
    pub description: Option<String>,
    /// Subpaths excluded when packing.
    #[serde(default)]
    pub ignore: Vec<String>,
}

/// An opaque shell invocation associated with a working directory, a
/// set of tags, and the artifacts it is expected to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub command: String,
    #[serde(default = "Command::default_working_directory", rename = "workingDirectory")]
    pub working_directory: RelativePath,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl Command {
    fn default_working_directory() -> RelativePath {
        RelativePath(PathBuf::from("."))
    }

    #[must_use]
    pub fn artifact_outputs(&self) -> Vec<&RelativePath> {
        self.artifacts.iter().map(|a| &a.output).collect()
    }
}

/// Files and environment variables that contribute to a Watcher's
/// cache-key scope without themselves being watched for changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Invalidators {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
}

/// A single entry in the configured plugin pipeline: a plugin name
/// plus its plugin-specific options blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// A set of input globs paired with the Commands that share their
/// cache-key scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Watcher {
    #[serde(default = "Watcher::default_enabled")]
    pub enabled: bool,
    pub files: Vec<String>,
    #[serde(default)]
    pub invalidators: Invalidators,
    #[serde(default)]
    pub ignored: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    pub commands: Vec<Command>,
}

impl Watcher {
    fn default_enabled() -> bool {
        true
    }
}

/// A Command resolved against its Watcher's file list and environment
/// names, ready for the Task Runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    pub command: Command,
    pub files: Vec<RelativePath>,
    pub environment_names: Vec<String>,
    pub watcher_label: Option<String>,
}

/// The recursive execution tree the Generator builds and the Command
/// Plugins rewrite. `Empty` is the identity element produced by
/// plugins that prune (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Command(ResolvedCommand),
    Parallel(Vec<Task>),
    Serial(Vec<Task>),
    Empty,
}

impl Task {
    /// The union of artifact outputs reachable from this subtree, in
    /// tree order. Used to check the Command Plugins' invariant that
    /// the union of artifacts never grows.
    #[must_use]
    pub fn artifact_outputs(&self) -> Vec<RelativePath> {
        let mut out = Vec::new();
        self.collect_artifact_outputs(&mut out);
        out
    }

    fn collect_artifact_outputs(&self, out: &mut Vec<RelativePath>) {
        match self {
            Task::Command(resolved) => {
                out.extend(resolved.command.artifacts.iter().map(|a| a.output.clone()));
            }
            Task::Parallel(tasks) | Task::Serial(tasks) => {
                for task in tasks {
                    task.collect_artifact_outputs(out);
                }
            }
            Task::Empty => {}
        }
    }
}

/// Ten-hex-character cache key: a keyed digest over ordered inputs
/// (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn from_hex(hex: String) -> Self {
        debug_assert_eq!(hex.len(), 10, "cache key must be 10 hex characters");
        Self(hex)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-artifact cache object name: a second digest over (cache key,
/// artifact output path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectName(String);

impl ObjectName {
    #[must_use]
    pub fn from_hex(hex: String) -> Self {
        debug_assert_eq!(hex.len(), 10, "object name must be 10 hex characters");
        Self(hex)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
