//! Generator (C9): builds the Task tree from configuration, applies
//! command plugins, and drives execution (spec.md §4.9).
//!
//! Grounded on `crates/core/src/tasks/executor.rs::execute_graph`'s
//! level-by-level `JoinSet` fan-out, generalized from named
//! `TaskGraph` nodes to the recursive Parallel/Serial/Command/Empty
//! tree the Command Plugins rewrite. `run_command` is public so the
//! Daemon (C10) can re-enter the identical middleware-plus-supervisor
//! path per debounced filesystem event.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::plugins;
use crate::resolver;
use crate::runner::{Middleware, RunContext, TaskRunner, Terminal};
use crate::supervisor;
use crate::types::{Artifact, ResolvedCommand, Task};
use shadowdog_events::{EventBus, ShadowdogEvent};

const ARTIFACT_WAIT_MAX_RETRIES_ENV: &str = "SHADOWDOG_ARTIFACT_WAIT_MAX_RETRIES";
const ARTIFACT_WAIT_DEFAULT_RETRIES: u32 = 50;
const ARTIFACT_WAIT_INTERVAL_MS: u64 = 100;

/// How the walk should behave when a Command fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    pub continue_on_error: bool,
}

/// Everything a Command execution needs that is shared across an
/// entire walk. Cheap to clone: every field is either `Copy`, an
/// `Arc`, or a small `Vec<Arc<_>>`.
#[derive(Clone)]
pub struct Drive {
    pub project_root: PathBuf,
    pub event_bus: Arc<EventBus>,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub continue_on_error: bool,
}

/// Resolve every enabled Watcher's Commands into the top-level
/// `Parallel` Task tree (spec.md §4.9's "Builds a top-level Parallel
/// of all Commands across all Watchers"). `preserve_nonexistent` is
/// always true here so the dependency-layering plugin can still see
/// edges to artifacts that have not been built yet.
pub fn build_task_tree(config: &Config, project_root: &Path) -> Result<Task> {
    let mut commands = Vec::new();
    for watcher in &config.watchers {
        if !watcher.enabled {
            continue;
        }
        let mut ignores = watcher.ignored.clone();
        ignores.extend(config.default_ignored_files.iter().cloned());

        let mut files = resolver::resolve(project_root, &watcher.files, &ignores, true, false)?;
        let invalidator_files = resolver::resolve(project_root, &watcher.invalidators.files, &ignores, true, false)?;
        files.extend(invalidator_files);

        for command in &watcher.commands {
            commands.push(Task::Command(ResolvedCommand {
                command: command.clone(),
                files: files.clone(),
                environment_names: watcher.invalidators.environment.clone(),
                watcher_label: watcher.label.clone(),
            }));
        }
    }
    Ok(Task::Parallel(commands))
}

/// Build the top-level Task tree, run the Command Plugins over it, and
/// walk it to completion.
pub async fn generate(config: &Config, drive: &Drive, options: GenerateOptions) -> Result<()> {
    drive.event_bus.emit(ShadowdogEvent::GenerateStarted);
    warn_if_empty_config(config);

    let task = build_task_tree(config, &drive.project_root)?;
    let task = plugins::apply_all(task, &config.plugins)?;

    let mut drive = drive.clone();
    drive.continue_on_error = options.continue_on_error;
    walk(&task, &drive).await?;

    drive.event_bus.emit(ShadowdogEvent::AllTasksComplete);
    Ok(())
}

/// Walk a Task tree: `Parallel` fans out via a `JoinSet`, `Serial`
/// drives children in order, `Command` runs through the middleware
/// chain, `Empty` is a no-op.
pub async fn walk(task: &Task, drive: &Drive) -> Result<()> {
    match task {
        Task::Empty => Ok(()),
        Task::Command(resolved) => run_command(resolved, drive).await,
        Task::Serial(children) => {
            for child in children {
                walk(child, drive).await?;
            }
            Ok(())
        }
        Task::Parallel(children) => walk_parallel(children, drive).await,
    }
}

async fn walk_parallel(children: &[Task], drive: &Drive) -> Result<()> {
    let mut join_set = JoinSet::new();
    for child in children {
        let child = child.clone();
        let drive = drive.clone();
        join_set.spawn(async move { walk(&child, &drive).await });
    }

    let mut first_err = None;
    while let Some(joined) = join_set.join_next().await {
        let outcome = match joined {
            Ok(result) => result,
            Err(join_err) => Err(Error::command_failed(-1, format!("task panicked: {join_err}"))),
        };
        if let Err(e) = outcome {
            if first_err.is_none() {
                first_err = Some(e);
            }
            if !drive.continue_on_error {
                join_set.abort_all();
                break;
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run a single resolved Command through the Task Runner: delete any
/// pre-existing artifacts, drive the middleware chain with the
/// Process Supervisor as the terminal, then verify artifact readiness.
/// Emits `begin`, and `end` or `error`, around the run.
pub async fn run_command(resolved: &ResolvedCommand, drive: &Drive) -> Result<()> {
    let artifact_paths: Vec<String> =
        resolved.command.artifact_outputs().iter().map(|p| p.to_string_lossy()).collect();

    drive.event_bus.emit(ShadowdogEvent::Begin { artifacts: artifact_paths.clone() });

    if let Err(e) = delete_existing_artifacts(&resolved.command.artifacts, &drive.project_root) {
        drive
            .event_bus
            .emit(ShadowdogEvent::Error { artifacts: artifact_paths.clone(), message: e.to_string() });
        return Err(e);
    }

    let mut ctx = RunContext::new(
        resolved.files.clone(),
        resolved.environment_names.clone(),
        resolved.command.clone(),
        drive.project_root.clone(),
        None,
        drive.event_bus.clone(),
        CancellationToken::new(),
    );
    let runner = TaskRunner::new(drive.middlewares.clone());
    let terminal = supervised_terminal();

    let result = match runner.run(&mut ctx, terminal.as_ref()).await {
        Ok(_) => wait_for_artifact_readiness(&resolved.command.artifacts, &drive.project_root).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            drive.event_bus.emit(ShadowdogEvent::End { artifacts: artifact_paths });
            Ok(())
        }
        Err(e) => {
            drive
                .event_bus
                .emit(ShadowdogEvent::Error { artifacts: artifact_paths, message: e.to_string() });
            Err(e)
        }
    }
}

/// Forces a fresh build: stale identical content would otherwise
/// satisfy the post-run SHA verification in the cache middlewares by
/// accident (spec.md §4.9).
fn delete_existing_artifacts(artifacts: &[Artifact], project_root: &Path) -> Result<()> {
    for artifact in artifacts {
        let full = artifact.output.resolve(project_root);
        let removed = if full.is_dir() {
            std::fs::remove_dir_all(&full)
        } else if full.exists() {
            std::fs::remove_file(&full)
        } else {
            continue;
        };
        if let Err(e) = removed {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::io(e, Some(full), "delete stale artifact before rebuild"));
            }
        }
    }
    Ok(())
}

fn artifact_wait_max_retries() -> u32 {
    std::env::var(ARTIFACT_WAIT_MAX_RETRIES_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(ARTIFACT_WAIT_DEFAULT_RETRIES)
}

fn is_artifact_ready(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len() > 0 && std::fs::File::open(path).is_ok(),
        Ok(_) => true,
        Err(_) => false,
    }
}

async fn wait_for_artifact_readiness(artifacts: &[Artifact], project_root: &Path) -> Result<()> {
    let max_retries = artifact_wait_max_retries();
    for artifact in artifacts {
        let full = artifact.output.resolve(project_root);
        let mut attempt = 0;
        while !is_artifact_ready(&full) {
            attempt += 1;
            if attempt >= max_retries {
                return Err(Error::artifact_unavailable(artifact.output.to_string_lossy()));
            }
            tokio::time::sleep(Duration::from_millis(ARTIFACT_WAIT_INTERVAL_MS)).await;
        }
    }
    Ok(())
}

/// A terminal frame that spawns through the Process Supervisor,
/// registering/unregistering the child's pid with the global registry
/// so the Daemon can kill superseded work.
fn supervised_terminal() -> Box<Terminal> {
    Box::new(move |ctx: &mut RunContext| {
        let registry = supervisor::global_registry();
        let command = ctx.command.command.clone();
        let cwd = ctx.command.working_directory.resolve(&ctx.project_root);
        let changed_file_path = ctx.changed_file_path.clone();
        Box::pin(async move {
            let pid_cell: Arc<std::sync::Mutex<u32>> = Arc::new(std::sync::Mutex::new(0));
            let pid_for_spawn = pid_cell.clone();
            let pid_for_exit = pid_cell.clone();
            let registry_for_spawn = registry.clone();
            let registry_for_exit = registry.clone();
            let label = command.clone();
            supervisor::run(
                &command,
                &cwd,
                changed_file_path.as_deref(),
                move |pid| {
                    *pid_for_spawn.lock().expect("pid cell lock poisoned") = pid;
                    registry_for_spawn.register(pid, label);
                },
                move || {
                    let pid = *pid_for_exit.lock().expect("pid cell lock poisoned");
                    registry_for_exit.unregister(pid);
                },
            )
            .await
        })
    })
}

fn warn_if_empty_config(config: &Config) {
    if config.watchers.is_empty() {
        warn!("configuration declares no watchers; generate() will be a no-op");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Command, RelativePath};
    use tempfile::TempDir;

    fn test_drive(project_root: &Path, continue_on_error: bool) -> Drive {
        Drive {
            project_root: project_root.to_path_buf(),
            event_bus: Arc::new(EventBus::new()),
            middlewares: vec![],
            continue_on_error,
        }
    }

    fn command(name: &str, output: &str) -> ResolvedCommand {
        ResolvedCommand {
            command: Command {
                command: name.to_string(),
                working_directory: RelativePath::new(".").unwrap(),
                tags: Default::default(),
                artifacts: vec![Artifact {
                    output: RelativePath::new(output).unwrap(),
                    description: None,
                    ignore: vec![],
                }],
            },
            files: vec![],
            environment_names: vec![],
            watcher_label: None,
        }
    }

    #[tokio::test]
    async fn run_command_emits_begin_then_end_on_success() {
        let project = TempDir::new().unwrap();
        let drive = test_drive(project.path(), false);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        drive.event_bus.subscribe(move |emission| {
            seen_clone.lock().unwrap().push(emission.event.marker().to_string());
        });

        let resolved = command("sh -c 'echo hi > out.txt'", "out.txt");
        run_command(&resolved, &drive).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["begin", "end"]);
        assert!(project.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn run_command_emits_error_on_nonzero_exit() {
        let project = TempDir::new().unwrap();
        let drive = test_drive(project.path(), false);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        drive.event_bus.subscribe(move |emission| {
            seen_clone.lock().unwrap().push(emission.event.marker().to_string());
        });

        let resolved = command("false", "out.txt");
        let err = run_command(&resolved, &drive).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(*seen.lock().unwrap(), vec!["begin", "error"]);
    }

    #[tokio::test]
    async fn artifact_not_produced_is_reported_as_unavailable() {
        let project = TempDir::new().unwrap();
        // SAFETY: test-local env var read only by this generator test module.
        unsafe { std::env::set_var(ARTIFACT_WAIT_MAX_RETRIES_ENV, "1") };
        let drive = test_drive(project.path(), false);
        let resolved = command("true", "never-written.txt");
        let err = run_command(&resolved, &drive).await.unwrap_err();
        unsafe { std::env::remove_var(ARTIFACT_WAIT_MAX_RETRIES_ENV) };
        assert!(matches!(err, Error::ArtifactUnavailable { .. }));
    }

    #[tokio::test]
    async fn parallel_continue_on_error_runs_every_sibling() {
        let project = TempDir::new().unwrap();
        let drive = test_drive(project.path(), true);
        let task = Task::Parallel(vec![
            Task::Command(command("false", "a.txt")),
            Task::Command(command("sh -c 'echo ok > b.txt'", "b.txt")),
        ]);
        let err = walk(&task, &drive).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert!(project.path().join("b.txt").exists(), "sibling must still run under continue_on_error");
    }

    #[tokio::test]
    async fn pre_existing_artifact_is_deleted_before_rebuild() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("out.txt"), "stale").unwrap();
        let drive = test_drive(project.path(), false);
        let resolved = command("sh -c 'echo fresh > out.txt'", "out.txt");
        run_command(&resolved, &drive).await.unwrap();
        assert_eq!(std::fs::read_to_string(project.path().join("out.txt")).unwrap(), "fresh\n");
    }

    #[test]
    fn build_task_tree_skips_disabled_watchers() {
        use crate::types::{Invalidators, Watcher};
        let project = TempDir::new().unwrap();
        let config = Config {
            schema: None,
            debounce_time_ms: 2000,
            default_ignored_files: vec![],
            plugins: vec![],
            watchers: vec![Watcher {
                enabled: false,
                files: vec![],
                invalidators: Invalidators::default(),
                ignored: vec![],
                label: None,
                commands: vec![Command {
                    command: "true".to_string(),
                    working_directory: RelativePath::new(".").unwrap(),
                    tags: Default::default(),
                    artifacts: vec![],
                }],
            }],
        };
        let task = build_task_tree(&config, project.path()).unwrap();
        assert_eq!(task, Task::Parallel(vec![]));
    }
}
