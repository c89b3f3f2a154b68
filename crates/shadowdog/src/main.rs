//! shadowdog: a content-addressed incremental artifact build daemon
//! driven by filesystem events.
//!
//! Grounded on `crates/cuenv-cli/src/main.rs`: the same panic-hook,
//! pre-parse-for-tracing, then full-`clap`-parse shape. Departs from
//! the teacher's bare `#[tokio::main]` (multi-threaded) runtime with
//! an explicit single-threaded `current_thread` runtime, since spec.md
//! §5 models the daemon as a single cooperative event loop rather than
//! a thread-parallel server.

mod cli;
mod tracing_init;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::instrument;
use tracing_init::{TracingConfig, TracingFormat};

use shadowdog_core::cache::{LocalCacheMiddleware, RemoteCacheMiddleware};
use shadowdog_core::generator::{self, Drive, GenerateOptions};
use shadowdog_core::runner::Middleware;
use shadowdog_core::{Config, LockWriter};
use shadowdog_daemon::{Daemon, NotifyChannel, ShutdownCoordinator, install_signal_handlers, rpc};
use shadowdog_events::EventBus;

fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("shadowdog panicked: {panic_info}");
        eprintln!("run with RUST_LOG=debug for more information");
    }));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    if let Err(error) = runtime.block_on(run_main()) {
        eprintln!("{error:?}");
        std::process::exit(1);
    }
}

#[instrument(name = "shadowdog_main")]
async fn run_main() -> miette::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let json_flag = args.iter().any(|a| a == "--json") || std::env::var("SHADOWDOG_JSON_LOGS").is_ok();
    let level_flag = args.windows(2).find_map(|pair| {
        if pair[0] == "--level" || pair[0] == "-l" { Some(pair[1].as_str()) } else { None }
    });
    let debug_env = std::env::var("DEBUG").is_ok();
    let log_level = match level_flag {
        Some("trace") => tracing::Level::TRACE,
        Some("debug") => tracing::Level::DEBUG,
        Some("info") => tracing::Level::INFO,
        Some("warn") => tracing::Level::WARN,
        Some("error") => tracing::Level::ERROR,
        _ if debug_env => tracing::Level::DEBUG,
        _ => tracing::Level::WARN,
    };

    tracing_init::init_tracing(TracingConfig {
        format: if json_flag { TracingFormat::Json } else { TracingFormat::Pretty },
        level: log_level,
    })
    .map_err(|e| miette::miette!("failed to initialize tracing: {e}"))?;

    run_cli().await
}

async fn run_cli() -> miette::Result<()> {
    let args = cli::parse();

    let project_root = std::env::current_dir().map_err(|e| miette::miette!("could not determine project root: {e}"))?;
    let config_path = if args.config.is_absolute() { args.config.clone() } else { project_root.join(&args.config) };

    let config = Config::load(&config_path).map_err(|e| miette::miette!("{e}"))?;

    let event_bus = Arc::new(EventBus::new());
    let middlewares = build_middlewares(&project_root);

    let lock_path = project_root.join("shadowdog-lock.json");
    let lock_writer = LockWriter::new(project_root.clone(), lock_path);
    LockWriter::install(lock_writer, &event_bus);

    if args.watch {
        run_daemon(project_root, config_path, config, event_bus, middlewares).await
    } else {
        run_batch(&project_root, &config, event_bus, middlewares).await
    }
}

fn build_middlewares(project_root: &std::path::Path) -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(LocalCacheMiddleware::new(project_root)),
        Arc::new(RemoteCacheMiddleware::new(String::new(), String::new())),
    ]
}

async fn run_batch(
    project_root: &std::path::Path,
    config: &Config,
    event_bus: Arc<EventBus>,
    middlewares: Vec<Arc<dyn Middleware>>,
) -> miette::Result<()> {
    let drive = Drive { project_root: project_root.to_path_buf(), event_bus, middlewares, continue_on_error: false };
    generator::generate(config, &drive, GenerateOptions { continue_on_error: false })
        .await
        .map_err(|e| miette::miette!("{e}"))
}

async fn run_daemon(
    project_root: PathBuf,
    config_path: PathBuf,
    config: Config,
    event_bus: Arc<EventBus>,
    middlewares: Vec<Arc<dyn Middleware>>,
) -> miette::Result<()> {
    let notify_socket = std::env::var("SHADOWDOG_NOTIFY_SOCKET").ok().map(PathBuf::from);
    let notify_channel = Arc::new(NotifyChannel::new(notify_socket));

    let shutdown = ShutdownCoordinator::new();
    install_signal_handlers(shutdown.clone());

    let daemon = Daemon::new(project_root, config_path, config, event_bus, middlewares, notify_channel, shutdown.clone());

    let rpc_daemon = Arc::clone(&daemon);
    tokio::spawn(async move { rpc::serve(rpc_daemon, None, None).await });

    daemon.run().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_middlewares_returns_both_cache_layers() {
        let dir = tempfile::TempDir::new().unwrap();
        let middlewares = build_middlewares(dir.path());
        assert_eq!(middlewares.len(), 2);
    }
}
