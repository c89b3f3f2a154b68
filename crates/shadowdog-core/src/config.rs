//! Strict JSON configuration loading (spec.md §6).

use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{PluginConfig, Watcher};

fn default_debounce_time_ms() -> u64 {
    2000
}

fn default_ignored_files() -> Vec<String> {
    vec![".git".to_string(), "**/node_modules".to_string()]
}

/// Top-level configuration document. Every level rejects unknown
/// properties (spec.md §6: "Validation rejects additional properties
/// at every level").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "debounceTime", default = "default_debounce_time_ms")]
    pub debounce_time_ms: u64,
    #[serde(rename = "defaultIgnoredFiles", default = "default_ignored_files")]
    pub default_ignored_files: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    pub watchers: Vec<Watcher>,
}

impl Config {
    /// Parse and validate a configuration document from its raw JSON
    /// text. Unknown keys at any level reject the whole document via
    /// `#[serde(deny_unknown_fields)]`.
    pub fn from_str(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)
            .map_err(|e| Error::config_invalid(format!("{e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(e, Some(path.to_path_buf()), "read config"))?;
        Self::from_str(&text)
    }

    fn validate(&self) -> Result<()> {
        // debounce_time_ms is a u64, so "ms, default 2000, >= 0" is
        // already structurally enforced by the type.
        for watcher in &self.watchers {
            if watcher.commands.is_empty() {
                return Err(Error::config_invalid(
                    "watcher must declare at least one command".to_string(),
                ));
            }
        }
        Ok(())
    }
}
