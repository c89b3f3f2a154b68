//! Command-line surface (spec.md §6): `--config` to point at a
//! configuration file other than the default, `--watch` to run the
//! daemon instead of a single batch generate.
//!
//! Grounded on `crates/cuenv-cli/src/cli.rs::Cli`: the same
//! `clap::Parser` derive with global `--level`/`--json` flags, trimmed
//! to a flat struct since shadowdog has exactly one operating mode
//! rather than a subcommand tree.

use std::path::PathBuf;

use clap::Parser;

use crate::tracing_init::LogLevel;

fn default_config_path() -> PathBuf {
    PathBuf::from("shadowdog.json")
}

#[derive(Parser, Debug)]
#[command(name = "shadowdog")]
#[command(about = "Content-addressed incremental artifact build daemon")]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "shadowdog.json")]
    pub config: PathBuf,

    /// Run as a long-lived daemon: watch the filesystem, serve RPC,
    /// and emit the notification side channel. Without this flag,
    /// shadowdog generates every artifact once and exits.
    #[arg(long)]
    pub watch: bool,

    #[arg(short = 'l', long, default_value = "warn", value_enum)]
    pub level: LogLevel,

    /// Output logs as JSON instead of the default pretty format.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config.clone()
    }
}

#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_the_conventional_config_path_and_batch_mode() {
        let cli = Cli::try_parse_from(["shadowdog"]).unwrap();
        assert_eq!(cli.config, default_config_path());
        assert!(!cli.watch);
        assert!(!cli.json);
    }

    #[test]
    fn watch_flag_is_recognized() {
        let cli = Cli::try_parse_from(["shadowdog", "--watch"]).unwrap();
        assert!(cli.watch);
    }

    #[test]
    fn config_flag_overrides_the_default_path() {
        let cli = Cli::try_parse_from(["shadowdog", "--config", "other.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.json"));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let result = Cli::try_parse_from(["shadowdog", "--level", "invalid"]);
        assert!(result.is_err());
    }
}
