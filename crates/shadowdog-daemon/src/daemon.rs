//! Daemon control loop (C10, spec.md §4.10): owns pause state, the
//! pending-change replay set, the live configuration, and dispatches
//! both filesystem triggers and RPC triggers through the same
//! kill-pending-then-run pipeline.
//!
//! Grounded on spec.md §9's design note for "Global daemon state":
//! instead of module-level mutables, a `Daemon` value owns the
//! pending-process list (via `shadowdog_core::supervisor`'s global
//! registry), the pause flag, the live config, and is passed by `Arc`
//! into every watcher/RPC callback.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use shadowdog_core::config::Config;
use shadowdog_core::error::{Error, Result};
use shadowdog_core::generator::{self, Drive};
use shadowdog_core::plugins;
use shadowdog_core::runner::Middleware;
use shadowdog_core::supervisor;
use shadowdog_core::types::{Artifact, Command as CommandConfig, ResolvedCommand, Task, Watcher as WatcherConfig};
use shadowdog_core::{cache, resolver};
use shadowdog_events::{Emission, EventBus, ShadowdogEvent};

use crate::notify_channel::{NotifyChannel, NotifyEvent};
use crate::shutdown::ShutdownCoordinator;
use crate::watcher::{self, WatchSet, WatchTrigger};

/// The well a `computeArtifact`/watcher-trigger run reaches into: the
/// owning Watcher's resolved file list and environment names, and the
/// single Command (with artifacts narrowed to one output when needed).
fn resolve_watcher_files(config: &Config, project_root: &Path, watcher: &WatcherConfig) -> Vec<shadowdog_core::types::RelativePath> {
    let mut ignores = watcher.ignored.clone();
    ignores.extend(config.default_ignored_files.iter().cloned());
    let mut files = resolver::resolve(project_root, &watcher.files, &ignores, true, false).unwrap_or_default();
    let invalidator_files =
        resolver::resolve(project_root, &watcher.invalidators.files, &ignores, true, false).unwrap_or_default();
    files.extend(invalidator_files);
    files
}

fn find_artifact<'a>(config: &'a Config, output: &str) -> Option<(&'a WatcherConfig, &'a CommandConfig, &'a Artifact)> {
    for watcher in &config.watchers {
        if !watcher.enabled {
            continue;
        }
        for command in &watcher.commands {
            for artifact in &command.artifacts {
                if artifact.output.to_string_lossy() == output {
                    return Some((watcher, command, artifact));
                }
            }
        }
    }
    None
}

fn all_outputs(config: &Config) -> Vec<String> {
    config
        .watchers
        .iter()
        .filter(|w| w.enabled)
        .flat_map(|w| &w.commands)
        .flat_map(|c| &c.artifacts)
        .map(|a| a.output.to_string_lossy())
        .collect()
}

pub struct Daemon {
    project_root: PathBuf,
    config_path: PathBuf,
    config: RwLock<Config>,
    event_bus: Arc<EventBus>,
    middlewares: Vec<Arc<dyn Middleware>>,
    paused: AtomicBool,
    pending_changes: StdMutex<HashMap<usize, HashSet<PathBuf>>>,
    notify_channel: Arc<NotifyChannel>,
    shutdown: ShutdownCoordinator,
    shutting_down: AtomicBool,
}

impl Daemon {
    #[must_use]
    pub fn new(
        project_root: PathBuf,
        config_path: PathBuf,
        config: Config,
        event_bus: Arc<EventBus>,
        middlewares: Vec<Arc<dyn Middleware>>,
        notify_channel: Arc<NotifyChannel>,
        shutdown: ShutdownCoordinator,
    ) -> Arc<Self> {
        let daemon = Arc::new(Self {
            project_root,
            config_path,
            config: RwLock::new(config),
            event_bus,
            middlewares,
            paused: AtomicBool::new(false),
            pending_changes: StdMutex::new(HashMap::new()),
            notify_channel,
            shutdown,
            shutting_down: AtomicBool::new(false),
        });
        install_notify_bridge(&daemon);
        daemon
    }

    #[must_use]
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn config_snapshot(&self) -> Config {
        self.config.read().expect("config lock poisoned").clone()
    }

    fn drive(&self) -> Drive {
        Drive {
            project_root: self.project_root.clone(),
            event_bus: Arc::clone(&self.event_bus),
            middlewares: self.middlewares.clone(),
            continue_on_error: true,
        }
    }

    /// Main loop: demultiplex filesystem triggers, config-file reload
    /// signals, and the shutdown signal until told to stop.
    pub async fn run(self: Arc<Self>) {
        self.event_bus.emit(ShadowdogEvent::Initialized);
        {
            let channel = Arc::clone(&self.notify_channel);
            tokio::spawn(async move { channel.send(&NotifyEvent::Initialized).await });
        }

        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<WatchTrigger>();
        let (config_change_tx, mut config_change_rx) = mpsc::unbounded_channel::<()>();

        let mut _watch_set: Option<WatchSet> = self.spawn_watch(trigger_tx.clone(), config_change_tx.clone());

        loop {
            tokio::select! {
                trigger = trigger_rx.recv() => {
                    match trigger {
                        Some(trigger) => self.handle_trigger(trigger).await,
                        None => break,
                    }
                }
                signal = config_change_rx.recv() => {
                    match signal {
                        Some(()) => {
                            if let Some(new_set) = self.handle_config_reload(trigger_tx.clone(), config_change_tx.clone()).await {
                                _watch_set = Some(new_set);
                            }
                        }
                        None => break,
                    }
                }
                () = self.shutdown.wait() => break,
            }
        }

        drop(_watch_set);
        self.shutdown_sequence().await;
    }

    fn spawn_watch(
        &self,
        trigger_tx: mpsc::UnboundedSender<WatchTrigger>,
        config_change_tx: mpsc::UnboundedSender<()>,
    ) -> Option<WatchSet> {
        let config = self.config_snapshot();
        let debounce = Duration::from_millis(config.debounce_time_ms);
        match watcher::spawn(
            &self.project_root,
            &self.config_path,
            &config.watchers,
            &config.default_ignored_files,
            debounce,
            trigger_tx,
            config_change_tx,
        ) {
            Ok(set) => Some(set),
            Err(e) => {
                error!(error = %e, "failed to start filesystem watch");
                None
            }
        }
    }

    async fn kill_pending(&self) {
        supervisor::global_registry().terminate(None, Duration::from_millis(0)).await;
    }

    async fn handle_trigger(&self, trigger: WatchTrigger) {
        if self.is_paused() {
            let mut pending = self.pending_changes.lock().expect("pending-changes lock poisoned");
            let entry = pending.entry(trigger.watcher_index).or_default();
            for (path, _) in &trigger.paths {
                entry.insert(path.clone());
            }
            return;
        }
        self.kill_pending().await;
        self.run_watcher(trigger.watcher_index).await;
    }

    async fn run_watcher(&self, watcher_index: usize) {
        let config = self.config_snapshot();
        let Some(watcher) = config.watchers.get(watcher_index) else { return };
        if !watcher.enabled {
            return;
        }
        let files = resolve_watcher_files(&config, &self.project_root, watcher);
        let commands: Vec<Task> = watcher
            .commands
            .iter()
            .map(|command| {
                Task::Command(ResolvedCommand {
                    command: command.clone(),
                    files: files.clone(),
                    environment_names: watcher.invalidators.environment.clone(),
                    watcher_label: watcher.label.clone(),
                })
            })
            .collect();

        let task = match plugins::apply_all(Task::Parallel(commands), &config.plugins) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "command plugins rejected this watcher's task tree");
                return;
            }
        };

        if let Err(e) = generator::walk(&task, &self.drive()).await {
            warn!(error = %e, "watcher-triggered run finished with an error");
        }
    }

    /// `pause`: filesystem events still arrive and are demultiplexed,
    /// but `handle_trigger` now only records them.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.event_bus.emit(ShadowdogEvent::Pause);
    }

    /// `resume`: replay every pending path by touching its mtime so it
    /// re-enters the watch pipeline on its own, then clear the set.
    pub async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.event_bus.emit(ShadowdogEvent::Resume);
        let pending = {
            let mut pending = self.pending_changes.lock().expect("pending-changes lock poisoned");
            std::mem::take(&mut *pending)
        };
        for paths in pending.into_values() {
            for path in paths {
                touch(&path);
            }
        }
    }

    /// `computeArtifact{output}`: resolve the owning Watcher/Command and
    /// run only that one artifact's Command, with the artifact list
    /// narrowed to just `output`.
    pub async fn compute_artifact(&self, output: &str) -> Result<()> {
        if self.is_paused() {
            info!(output, "compute_artifact ignored: daemon is paused");
            return Ok(());
        }
        self.event_bus.emit(ShadowdogEvent::ComputeArtifact { output: output.to_string() });
        self.kill_pending().await;

        let config = self.config_snapshot();
        let (watcher, command, artifact) = find_artifact(&config, output)
            .ok_or_else(|| Error::rpc_bad_request(format!("no configured artifact named '{output}'")))?;
        let resolved = self.resolve_single(&config, watcher, command, artifact);
        generator::run_command(&resolved, &self.drive()).await
    }

    /// `computeAllArtifacts`: the same single-artifact pipeline, run in
    /// turn for every configured artifact.
    pub async fn compute_all_artifacts(&self) -> Result<()> {
        if self.is_paused() {
            info!("compute_all_artifacts ignored: daemon is paused");
            return Ok(());
        }
        let config = self.config_snapshot();
        let outputs = all_outputs(&config);
        self.event_bus.emit(ShadowdogEvent::ComputeAllArtifacts { artifacts: outputs.clone() });

        for output in outputs {
            self.kill_pending().await;
            if let Some((watcher, command, artifact)) = find_artifact(&config, &output) {
                let resolved = self.resolve_single(&config, watcher, command, artifact);
                if let Err(e) = generator::run_command(&resolved, &self.drive()).await {
                    warn!(output, error = %e, "compute_all_artifacts: command failed, continuing");
                }
            }
        }
        Ok(())
    }

    fn resolve_single(
        &self,
        config: &Config,
        watcher: &WatcherConfig,
        command: &CommandConfig,
        artifact: &Artifact,
    ) -> ResolvedCommand {
        let files = resolve_watcher_files(config, &self.project_root, watcher);
        let mut narrowed = command.clone();
        narrowed.artifacts = vec![artifact.clone()];
        ResolvedCommand {
            command: narrowed,
            files,
            environment_names: watcher.invalidators.environment.clone(),
            watcher_label: watcher.label.clone(),
        }
    }

    /// `clear_cache`: remove every object from the local cache root.
    /// The remote cache backend has no analogous bulk-delete in scope.
    pub fn clear_cache(&self) -> Result<()> {
        let root = cache::default_cache_root(&self.project_root);
        match std::fs::remove_dir_all(&root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(e, Some(root), "clear local cache")),
        }
        let channel = Arc::clone(&self.notify_channel);
        tokio::spawn(async move { channel.send(&NotifyEvent::Clear).await });
        Ok(())
    }

    async fn handle_config_reload(
        &self,
        trigger_tx: mpsc::UnboundedSender<WatchTrigger>,
        config_change_tx: mpsc::UnboundedSender<()>,
    ) -> Option<WatchSet> {
        let text = match std::fs::read_to_string(&self.config_path) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "could not read configuration file on reload, keeping previous configuration active");
                return None;
            }
        };
        let new_config = match Config::from_str(&text) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "configuration reload rejected, keeping previous configuration active");
                return None;
            }
        };

        let config_value = serde_json::to_value(&new_config).unwrap_or(serde_json::Value::Null);
        let debounce = Duration::from_millis(new_config.debounce_time_ms);
        let watchers = new_config.watchers.clone();
        let default_ignored_files = new_config.default_ignored_files.clone();
        *self.config.write().expect("config lock poisoned") = new_config;

        self.event_bus.emit(ShadowdogEvent::ConfigLoaded { config: config_value });

        match watcher::spawn(
            &self.project_root,
            &self.config_path,
            &watchers,
            &default_ignored_files,
            debounce,
            trigger_tx,
            config_change_tx,
        ) {
            Ok(set) => Some(set),
            Err(e) => {
                error!(error = %e, "failed to restart filesystem watch after configuration reload");
                None
            }
        }
    }

    /// `exit`: idempotent. Safe to call from a signal handler and from
    /// an RPC-triggered graceful stop.
    async fn shutdown_sequence(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.event_bus.emit(ShadowdogEvent::Exit);
        supervisor::global_registry().terminate(None, Duration::from_secs(5)).await;
    }

    /// Trigger a shutdown of the running daemon loop (used by the RPC
    /// surface and by signal handlers alike).
    pub fn request_shutdown(&self) {
        self.shutdown.trigger();
    }
}

fn touch(path: &Path) {
    if let Err(e) = filetime::set_file_mtime(path, filetime::FileTime::now()) {
        warn!(path = %path.display(), error = %e, "failed to touch pending-change path on resume");
    }
}

/// Bridge `Begin`/`End`/`Error` emissions onto the notification side
/// channel as `CHANGED_FILE{ready:false}`, `CHANGED_FILE{ready:true}`,
/// and `ERROR{file, message}` respectively (spec.md §6).
fn install_notify_bridge(daemon: &Arc<Daemon>) {
    let notify_channel = Arc::clone(&daemon.notify_channel);
    daemon.event_bus.subscribe(move |emission: &Emission| {
        let notify_channel = Arc::clone(&notify_channel);
        match &emission.event {
            ShadowdogEvent::Begin { artifacts } => {
                let artifacts = artifacts.clone();
                tokio::spawn(async move {
                    for file in artifacts {
                        notify_channel.send(&NotifyEvent::ChangedFile { file, ready: false }).await;
                    }
                });
            }
            ShadowdogEvent::End { artifacts } => {
                let artifacts = artifacts.clone();
                tokio::spawn(async move {
                    for file in artifacts {
                        notify_channel.send(&NotifyEvent::ChangedFile { file, ready: true }).await;
                    }
                });
            }
            ShadowdogEvent::Error { artifacts, message } => {
                let artifacts = artifacts.clone();
                let message = message.clone();
                tokio::spawn(async move {
                    for file in artifacts {
                        notify_channel.send(&NotifyEvent::Error { file, message: message.clone() }).await;
                    }
                });
            }
            _ => {}
        }
    });
}
