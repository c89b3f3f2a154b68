//! End-to-end coverage of the Generator, Cache Middlewares and Lock
//! File Writer wired together the same way `main.rs` wires them,
//! exercising the cold/warm-run and dependency-layering scenarios.

use std::sync::Arc;

use shadowdog_core::cache::LocalCacheMiddleware;
use shadowdog_core::config::Config;
use shadowdog_core::generator::{self, Drive, GenerateOptions};
use shadowdog_core::lockfile::LockWriter;
use shadowdog_events::EventBus;
use tempfile::TempDir;

fn drive(project_root: &std::path::Path, cache_root: &std::path::Path) -> Drive {
    Drive {
        project_root: project_root.to_path_buf(),
        event_bus: Arc::new(EventBus::new()),
        middlewares: vec![Arc::new(LocalCacheMiddleware::new(project_root).with_cache_root(cache_root.to_path_buf()))],
        continue_on_error: false,
    }
}

#[tokio::test]
async fn cold_run_builds_then_warm_run_restores_from_cache() {
    let project = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    std::fs::write(project.path().join("src.txt"), "hello").unwrap();

    let config = Config::from_str(
        r#"{
            "watchers": [
                {
                    "files": ["src.txt"],
                    "commands": [
                        { "command": "sh -c 'cp src.txt dist/out.txt'", "artifacts": [{ "output": "dist/out.txt" }] }
                    ]
                }
            ]
        }"#,
    )
    .unwrap();

    generator::generate(&config, &drive(project.path(), cache.path()), GenerateOptions::default()).await.unwrap();
    assert_eq!(std::fs::read_to_string(project.path().join("dist/out.txt")).unwrap(), "hello");

    std::fs::remove_file(project.path().join("dist/out.txt")).unwrap();
    generator::generate(&config, &drive(project.path(), cache.path()), GenerateOptions::default()).await.unwrap();
    assert_eq!(std::fs::read_to_string(project.path().join("dist/out.txt")).unwrap(), "hello");
}

#[tokio::test]
async fn lock_file_is_written_after_a_generate_run() {
    let project = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    std::fs::write(project.path().join("src.txt"), "hello").unwrap();

    let config = Config::from_str(
        r#"{
            "watchers": [
                {
                    "files": ["src.txt"],
                    "commands": [
                        { "command": "sh -c 'cp src.txt dist/out.txt'", "artifacts": [{ "output": "dist/out.txt" }] }
                    ]
                }
            ]
        }"#,
    )
    .unwrap();

    let drive = drive(project.path(), cache.path());
    let lock_writer = LockWriter::new(project.path().to_path_buf(), project.path().join("shadowdog-lock.json"));
    LockWriter::install(lock_writer, &drive.event_bus);

    generator::generate(&config, &drive, GenerateOptions::default()).await.unwrap();

    // The rewrite is spawned off the emitting thread; give it a moment.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(project.path().join("shadowdog-lock.json").exists());
}

#[tokio::test]
async fn failing_command_is_reported_and_artifact_is_absent() {
    let project = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    let config = Config::from_str(
        r#"{
            "watchers": [
                { "files": [], "commands": [ { "command": "false", "artifacts": [{ "output": "out.txt" }] } ] }
            ]
        }"#,
    )
    .unwrap();

    let err = generator::generate(&config, &drive(project.path(), cache.path()), GenerateOptions::default()).await.unwrap_err();
    assert!(matches!(err, shadowdog_core::Error::CommandFailed { .. }));
    assert!(!project.path().join("out.txt").exists());
}
