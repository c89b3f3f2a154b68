//! Cache Middlewares (C6): local-filesystem and S3-compatible
//! remote backends sharing one read-before/write-after protocol
//! (spec.md §4.6).

mod local;
mod remote;

pub use local::{LocalCacheMiddleware, default_cache_root};
pub use remote::RemoteCacheMiddleware;

/// Parses a kill-switch env var's value as a boolean override.
/// `"0"`/`"false"`/`"no"` (case-insensitive) are false; anything else
/// present is true. Called fresh on every middleware invocation, per
/// spec.md §4.6's "these overrides are read per middleware invocation,
/// not cached."
fn parse_bool_env(raw: &str) -> bool {
    !matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no")
}

fn env_bool_override(name: &str, default: bool) -> bool {
    std::env::var(name).map(|v| parse_bool_env(&v)).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_falsey_values() {
        assert!(!parse_bool_env("0"));
        assert!(!parse_bool_env("false"));
        assert!(!parse_bool_env("FALSE"));
        assert!(!parse_bool_env("no"));
    }

    #[test]
    fn parses_truthy_values() {
        assert!(parse_bool_env("1"));
        assert!(parse_bool_env("true"));
        assert!(parse_bool_env("anything"));
    }
}
