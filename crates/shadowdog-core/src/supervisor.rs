//! Process Supervisor (C5): spawn an opaque shell command in a fresh
//! process group, capture stderr, and support killing the whole
//! descendant tree (spec.md §4.5).
//!
//! Grounded on `crates/core/src/tasks/executor.rs` for the
//! shell-wrapping / output-capture idiom, and
//! `crates/core/src/tasks/process_registry.rs` for the
//! SIGTERM-then-SIGKILL-on-process-group registry (`libc::kill`
//! against the negated pid on `cfg(unix)`). Unlike the teacher's
//! executor, shadowdog's Command is always an opaque shell string
//! (spec.md §1 Non-goals), so execution always goes through a shell
//! interpreter rather than argv mode.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

use crate::error::{Error, Result};

/// Tracks every live child process by pid so the Daemon can kill
/// superseded work. A process group id is always `-(pid as i32)` on
/// unix, since every child is spawned as its own group leader.
pub struct ProcessRegistry {
    pids: Mutex<HashMap<u32, String>>,
}

static REGISTRY: OnceLock<std::sync::Arc<ProcessRegistry>> = OnceLock::new();

/// The process-wide registry singleton.
pub fn global_registry() -> std::sync::Arc<ProcessRegistry> {
    REGISTRY
        .get_or_init(|| std::sync::Arc::new(ProcessRegistry::new()))
        .clone()
}

impl ProcessRegistry {
    fn new() -> Self {
        Self {
            pids: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, pid: u32, label: impl Into<String>) {
        self.pids.lock().expect("process registry lock poisoned").insert(pid, label.into());
    }

    pub fn unregister(&self, pid: u32) {
        self.pids.lock().expect("process registry lock poisoned").remove(&pid);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.pids.lock().expect("process registry lock poisoned").len()
    }

    /// Kill every tracked process group matching `label` (or every
    /// process, if `label` is `None`): SIGTERM first, then SIGKILL
    /// after `timeout` if still alive.
    pub async fn terminate(&self, label: Option<&str>, timeout: Duration) {
        let targets: Vec<u32> = {
            let pids = self.pids.lock().expect("process registry lock poisoned");
            pids.iter()
                .filter(|(_, l)| label.is_none_or(|want| l.as_str() == want))
                .map(|(pid, _)| *pid)
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        for pid in &targets {
            signal_group(*pid, Signal::Term);
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let still_alive = targets.iter().any(|pid| process_alive(*pid));
            if !still_alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for pid in &targets {
            if process_alive(*pid) {
                signal_group(*pid, Signal::Kill);
            }
        }
        let mut pids = self.pids.lock().expect("process registry lock poisoned");
        for pid in &targets {
            pids.remove(pid);
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negated pid targets the whole process group, killing descendants too.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

#[cfg(windows)]
fn signal_group(_pid: u32, _signal: Signal) {
    // Process-group signaling has no direct windows equivalent in the
    // corpus; out of scope for this build (unix is the only target
    // execution environment).
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(windows)]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Substitutes the literal token `$FILE` in `command` with
/// `changed_file_path`'s path when provided.
fn substitute_file_token(command: &str, changed_file_path: Option<&Path>) -> String {
    match changed_file_path {
        Some(path) => command.replace("$FILE", &path.to_string_lossy()),
        None => command.to_string(),
    }
}

/// Spawn `command` as a shell invocation in `cwd`, inside a fresh
/// process group. Resolves `Ok(())` on exit status 0; fails with
/// `CommandFailed` (carrying the accumulated stderr) otherwise.
/// `on_spawn` is called with the child's pid as soon as it is known
/// (used by the Daemon to register it for cancellation); `on_exit` is
/// called once the child has exited, before returning.
pub async fn run(
    command: &str,
    cwd: &Path,
    changed_file_path: Option<&Path>,
    on_spawn: impl FnOnce(u32),
    on_exit: impl FnOnce(),
) -> Result<()> {
    let substituted = substitute_file_token(command, changed_file_path);

    let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("/bin/sh", "-c") };
    let mut cmd = TokioCommand::new(shell);
    cmd.arg(flag)
        .arg(&substituted)
        .current_dir(cwd)
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::io(e, Some(cwd.to_path_buf()), "spawn command"))?;
    let pid = child.id().ok_or_else(|| Error::command_failed(-1, "child exited before pid was observable"))?;
    on_spawn(pid);

    let mut stderr_pipe = child.stderr.take().expect("stderr was requested as piped");
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = child
        .wait()
        .await
        .map_err(|e| Error::io(e, Some(cwd.to_path_buf()), "wait for command"))?;
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    on_exit();

    if status.success() {
        Ok(())
    } else {
        let exit_code = status.code().unwrap_or(-1);
        Err(Error::command_failed(exit_code, String::from_utf8_lossy(&stderr_bytes).into_owned()))
    }
}
