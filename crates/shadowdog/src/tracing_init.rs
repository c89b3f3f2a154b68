//! Structured logging setup (spec.md §7's "user-visible output"
//! section, generalized with an ambient `tracing` stack since the
//! spec's observability Non-goals scope out metrics, not logging).
//!
//! Grounded on `crates/cuenv-cli/src/tracing.rs::init_tracing`,
//! trimmed from the teacher's four formats (Pretty/Compact/Json/Dev)
//! to two: `Pretty` for an interactive terminal and `Json` for piping
//! into log aggregation, since shadowdog has no `Dev`-specific
//! instrumentation and a `Compact` mode adds nothing `Pretty` doesn't
//! already cover for a single long-running process.

use std::io;

use tracing::Level;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum TracingFormat {
    /// Pretty-printed, human-readable format (the default).
    Pretty,
    /// Structured JSON, one object per line.
    Json,
}

/// Verbosity, mirroring `RUST_LOG`'s five levels.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub format: TracingFormat,
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self { format: TracingFormat::Pretty, level: Level::WARN }
    }
}

/// Build the `EnvFilter`, honoring `RUST_LOG`/`DEBUG` (spec.md §6's
/// environment-variable table) ahead of `config.level`, then install
/// the chosen format's `fmt::layer()`.
pub fn init_tracing(config: TracingConfig) -> miette::Result<()> {
    let level_str = match config.level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("shadowdog={level_str},shadowdog_core={level_str},shadowdog_daemon={level_str}")))
        .map_err(|e| miette::miette!("failed to build tracing filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        TracingFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(io::stderr)
                .with_target(true)
                .with_thread_ids(false);
            registry.with(layer).init();
        }
        TracingFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_current_span(true)
                .with_span_list(false);
            registry.with(layer).init();
        }
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), format = ?config.format, "shadowdog starting");
    Ok(())
}
