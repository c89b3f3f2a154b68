//! Error taxonomy for the build engine (spec.md §7).

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Main error type for shadowdog-core operations.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Configuration failed schema validation on load or reload.
    #[error("configuration invalid: {message}")]
    #[diagnostic(code(shadowdog::config::invalid))]
    ConfigInvalid {
        /// What validation rejected.
        message: String,
    },

    /// The dependency-layering plugin found a cycle.
    #[error("dependency cycle detected, involving outputs: {outputs:?}")]
    #[diagnostic(code(shadowdog::plugins::cycle))]
    CycleDetected {
        /// The artifact output paths on the cycle.
        outputs: Vec<String>,
    },

    /// An archive could not be packed or unpacked.
    #[error("failed to {operation} artifact archive for {path}: {source}")]
    #[diagnostic(code(shadowdog::codec::pack_unpack))]
    CachePackUnpackFail {
        /// "pack" or "unpack".
        operation: String,
        /// The artifact output path involved.
        path: String,
        /// The underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// The terminal command exited non-zero.
    #[error("command failed with exit code {exit_code}: {stderr}")]
    #[diagnostic(code(shadowdog::runner::command_failed))]
    CommandFailed {
        /// Process exit code, or -1 if killed by signal.
        exit_code: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// A declared artifact did not become available after the
    /// readiness poll window.
    #[error("artifact unavailable after command completed: {path}")]
    #[diagnostic(code(shadowdog::generator::artifact_unavailable))]
    ArtifactUnavailable {
        /// The artifact output path.
        path: String,
    },

    /// I/O error with path context.
    #[error("I/O error during {operation}{}: {source}", path.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
    #[diagnostic(code(shadowdog::io))]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// The path involved, if any.
        path: Option<PathBuf>,
        /// Description of the operation that failed.
        operation: String,
    },

    /// A malformed or unknown RPC request.
    #[error("bad RPC request: {message}")]
    #[diagnostic(code(shadowdog::rpc::bad_request))]
    RpcBadRequest {
        /// Why the request was rejected.
        message: String,
    },

    /// Cache-key computation failed because an input file disappeared
    /// mid-resolution (fatal during an explicit lookup; tolerated
    /// during a watch-mode initial scan via `preserve_nonexistent`).
    #[error("cache key input missing: {path}")]
    #[diagnostic(code(shadowdog::cache_key::input_missing))]
    CacheKeyInput {
        /// The missing path.
        path: String,
    },
}

impl Error {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn cycle_detected(outputs: Vec<String>) -> Self {
        Self::CycleDetected { outputs }
    }

    pub fn command_failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn artifact_unavailable(path: impl Into<String>) -> Self {
        Self::ArtifactUnavailable { path: path.into() }
    }

    pub fn io(source: std::io::Error, path: Option<PathBuf>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path,
            operation: operation.into(),
        }
    }

    pub fn rpc_bad_request(message: impl Into<String>) -> Self {
        Self::RpcBadRequest {
            message: message.into(),
        }
    }

    pub fn cache_key_input(path: impl Into<String>) -> Self {
        Self::CacheKeyInput { path: path.into() }
    }

    pub fn pack_unpack(operation: impl Into<String>, path: impl Into<String>, source: Error) -> Self {
        Self::CachePackUnpackFail {
            operation: operation.into(),
            path: path.into(),
            source: Box::new(source),
        }
    }
}

/// Result type for shadowdog-core operations.
pub type Result<T> = std::result::Result<T, Error>;
