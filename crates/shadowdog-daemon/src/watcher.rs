//! Filesystem watch half of the Daemon/Watcher component (C10, spec.md
//! §4.10): one recursive watch demultiplexed per configured Watcher,
//! each with its own debounce window.
//!
//! Grounded on the design note in spec.md §9 ("Global daemon state...
//! pass it explicitly into the watcher callbacks... process-wide side
//! effects accessed through thin abstractions"): the `notify` callback
//! itself stays a thin forwarder into a channel; all decision logic
//! (which Watcher a path belongs to, debouncing, pause) lives in plain
//! async tasks that are easy to reason about and to fake in tests.
//! `crates/core`'s own build has no incremental filesystem watcher to
//! ground this on directly, so the debounce loop follows the
//! standard tokio "collect until idle" shape rather than a specific
//! teacher file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};
use shadowdog_events::ChangeKind;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shadowdog_core::resolver;
use shadowdog_core::types::Watcher as WatcherConfig;

/// One coalesced batch of filesystem changes for a single configured
/// Watcher, ready for the Daemon's handler.
#[derive(Debug)]
pub struct WatchTrigger {
    pub watcher_index: usize,
    pub paths: Vec<(PathBuf, ChangeKind)>,
}

/// A single raw, classified filesystem event, before it has been
/// attributed to any configured Watcher.
struct RawChange {
    path: PathBuf,
    kind: ChangeKind,
}

fn classify(event: &Event) -> Option<ChangeKind> {
    match event.kind {
        EventKind::Create(_) => Some(ChangeKind::Add),
        EventKind::Modify(_) => Some(ChangeKind::Modify),
        EventKind::Remove(_) => Some(ChangeKind::Remove),
        _ => None,
    }
}

/// Owns the OS-level watch and every per-Watcher debounce task. Dropping
/// this value tears down the watch and all debounce tasks, matching
/// spec.md §4.10's "close existing watches" step on config reload.
pub struct WatchSet {
    _watcher: RecommendedWatcher,
    _debounce_tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Start one recursive watch over `project_root`, demultiplexed into a
/// per-Watcher debounce task for every enabled Watcher in `watchers`,
/// plus a dedicated watch on the configuration file at `config_path`.
/// Coalesced triggers are delivered on `trigger_tx`; a lone config-file
/// change is delivered on `config_change_tx`.
pub fn spawn(
    project_root: &Path,
    config_path: &Path,
    watchers: &[WatcherConfig],
    default_ignored_files: &[String],
    debounce: Duration,
    trigger_tx: mpsc::UnboundedSender<WatchTrigger>,
    config_change_tx: mpsc::UnboundedSender<()>,
) -> notify::Result<WatchSet> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<RawChange>();

    let watch_root = project_root.to_path_buf();
    let mut notify_watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let Some(kind) = classify(&event) else { return };
            for path in event.paths {
                let _ = raw_tx.send(RawChange { path, kind });
            }
        }
        Err(e) => warn!(error = %e, "filesystem watch error"),
    })?;
    notify_watcher.watch(&watch_root, RecursiveMode::Recursive)?;

    let config_path = config_path.to_path_buf();
    let project_root = project_root.to_path_buf();

    struct PerWatcher {
        files: Vec<String>,
        ignore: Box<dyn Fn(&Path) -> bool + Send + Sync>,
        sender: mpsc::UnboundedSender<(PathBuf, ChangeKind)>,
    }

    let mut per_watcher = Vec::with_capacity(watchers.len());
    let mut debounce_tasks = Vec::new();

    for (index, watcher) in watchers.iter().enumerate() {
        if !watcher.enabled {
            continue;
        }
        let mut ignores = watcher.ignored.clone();
        ignores.extend(default_ignored_files.iter().cloned());
        let ignore_matcher = resolver::build_ignore_matcher(&ignores);

        let (tx, rx) = mpsc::unbounded_channel::<(PathBuf, ChangeKind)>();
        debounce_tasks.push(tokio::spawn(debounce_loop(index, rx, debounce, trigger_tx.clone())));

        per_watcher.push(PerWatcher { files: watcher.files.clone(), ignore: ignore_matcher, sender: tx });
    }

    tokio::spawn(async move {
        while let Some(change) = raw_rx.recv().await {
            let relative = match change.path.strip_prefix(&project_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => change.path.clone(),
            };
            if change.path == config_path {
                let _ = config_change_tx.send(());
                continue;
            }
            let relative_str = relative.to_string_lossy().into_owned();
            for pw in &per_watcher {
                if (pw.ignore)(&relative) {
                    continue;
                }
                if resolver::path_matches_any(&relative_str, &pw.files) {
                    let _ = pw.sender.send((change.path.clone(), change.kind));
                }
            }
        }
    });

    Ok(WatchSet { _watcher: notify_watcher, _debounce_tasks: debounce_tasks })
}

/// Collect changed paths for one Watcher until `debounce` has elapsed
/// with no new events, then emit a single coalesced trigger.
async fn debounce_loop(
    watcher_index: usize,
    mut rx: mpsc::UnboundedReceiver<(PathBuf, ChangeKind)>,
    debounce: Duration,
    trigger_tx: mpsc::UnboundedSender<WatchTrigger>,
) {
    loop {
        let Some(first) = rx.recv().await else { return };
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        seen.insert(first.0.clone());
        paths.push(first);

        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some((path, kind))) => {
                    if seen.insert(path.clone()) {
                        paths.push((path, kind));
                    }
                }
                Ok(None) => {
                    debug!(watcher_index, "watch channel closed mid-debounce");
                    return;
                }
                Err(_elapsed) => break,
            }
        }

        if trigger_tx.send(WatchTrigger { watcher_index, paths }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_create_modify_remove_and_drops_everything_else() {
        use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind};

        let create = Event::new(EventKind::Create(CreateKind::File));
        assert_eq!(classify(&create), Some(ChangeKind::Add));

        let modify = Event::new(EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)));
        assert_eq!(classify(&modify), Some(ChangeKind::Modify));

        let remove = Event::new(EventKind::Remove(RemoveKind::File));
        assert_eq!(classify(&remove), Some(ChangeKind::Remove));

        let access = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)));
        assert_eq!(classify(&access), None);
    }

    #[tokio::test]
    async fn debounce_loop_coalesces_rapid_events_into_one_trigger() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<(PathBuf, ChangeKind)>();
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<WatchTrigger>();
        tokio::spawn(debounce_loop(3, raw_rx, Duration::from_millis(20), trigger_tx));

        raw_tx.send((PathBuf::from("a.txt"), ChangeKind::Modify)).unwrap();
        raw_tx.send((PathBuf::from("b.txt"), ChangeKind::Add)).unwrap();
        raw_tx.send((PathBuf::from("a.txt"), ChangeKind::Modify)).unwrap();

        let trigger = trigger_rx.recv().await.unwrap();
        assert_eq!(trigger.watcher_index, 3);
        assert_eq!(trigger.paths.len(), 2);
    }

    #[tokio::test]
    async fn debounce_loop_emits_a_separate_trigger_once_idle_elapses_between_bursts() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<(PathBuf, ChangeKind)>();
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<WatchTrigger>();
        tokio::spawn(debounce_loop(0, raw_rx, Duration::from_millis(15), trigger_tx));

        raw_tx.send((PathBuf::from("a.txt"), ChangeKind::Modify)).unwrap();
        let first = trigger_rx.recv().await.unwrap();
        assert_eq!(first.paths.len(), 1);

        raw_tx.send((PathBuf::from("b.txt"), ChangeKind::Add)).unwrap();
        let second = trigger_rx.recv().await.unwrap();
        assert_eq!(second.paths.len(), 1);
        assert_eq!(second.paths[0].0, PathBuf::from("b.txt"));
    }

    #[test]
    fn ignore_matcher_and_file_glob_demultiplex_a_path_to_the_right_watcher() {
        let ignore = resolver::build_ignore_matcher(&["*.tmp".to_string()]);
        assert!(ignore(Path::new("build/scratch.tmp")));
        assert!(!ignore(Path::new("src/main.rs")));

        assert!(resolver::path_matches_any("src/main.rs", &["src/**/*.rs".to_string()]));
        assert!(!resolver::path_matches_any("docs/readme.md", &["src/**/*.rs".to_string()]));
    }
}
