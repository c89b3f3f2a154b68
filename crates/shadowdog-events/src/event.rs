//! The event taxonomy threaded across the daemon, the generator, the
//! command plugins, the lock file writer and the RPC surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of filesystem change that triggered a `changed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Remove,
}

/// One emission on the bus. `id`/`emitted_at` are stamped by the bus at
/// emit time so subscribers can order events even if they arrive on
/// different threads downstream (e.g. the RPC surface forwarding them
/// over HTTP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emission {
    pub id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ShadowdogEvent,
}

/// Tagged union of every event shadowdog emits. Payloads are kept free
/// of `shadowdog-core` types (plain `String`/`serde_json::Value`) so
/// this crate has no dependency on the core crate, avoiding a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ShadowdogEvent {
    Initialized,
    Exit,
    ConfigLoaded {
        config: serde_json::Value,
    },
    GenerateStarted,
    AllTasksComplete,
    Begin {
        artifacts: Vec<String>,
    },
    End {
        artifacts: Vec<String>,
    },
    Error {
        artifacts: Vec<String>,
        message: String,
    },
    Changed {
        path: String,
        kind: ChangeKind,
    },
    Pause,
    Resume,
    ComputeArtifact {
        output: String,
    },
    ComputeAllArtifacts {
        artifacts: Vec<String>,
    },
}

impl ShadowdogEvent {
    /// Short semantic marker used for CLI/log-line prefixes, matching
    /// spec.md §7's "lines are prefixed with a short semantic marker."
    #[must_use]
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Initialized => "init",
            Self::Exit => "exit",
            Self::ConfigLoaded { .. } => "config",
            Self::GenerateStarted => "generate",
            Self::AllTasksComplete => "done",
            Self::Begin { .. } => "begin",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
            Self::Changed { .. } => "changed",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::ComputeArtifact { .. } => "compute",
            Self::ComputeAllArtifacts { .. } => "compute-all",
        }
    }
}
