//! Idempotent shutdown coordination (spec.md §4.10 "Shutdown").
//!
//! Grounded on `crates/cuenv-cli/src/shutdown.rs::ShutdownCoordinator`,
//! reused near-verbatim: a `tokio::sync::Notify`-backed coordinator that
//! any task can await, plus a signal-handler task that notifies it on
//! SIGINT/SIGTERM.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self { notify: Arc::new(Notify::new()) }
    }

    pub fn trigger(&self) {
        info!("shutdown triggered");
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Install SIGINT/SIGTERM handlers that trigger `coordinator`.
pub fn install_signal_handlers(coordinator: ShutdownCoordinator) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }

        #[cfg(windows)]
        {
            use tokio::signal::windows;

            let mut ctrl_c = windows::ctrl_c().expect("failed to install Ctrl+C handler");
            let mut ctrl_break = windows::ctrl_break().expect("failed to install Ctrl+Break handler");

            tokio::select! {
                _ = ctrl_c.recv() => info!("received Ctrl+C"),
                _ = ctrl_break.recv() => info!("received Ctrl+Break"),
            }
        }

        coordinator.trigger();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_every_waiter() {
        let coordinator = ShutdownCoordinator::new();
        let a = coordinator.clone();
        let b = coordinator.clone();
        let wait_a = tokio::spawn(async move { a.wait().await });
        let wait_b = tokio::spawn(async move { b.wait().await });
        tokio::task::yield_now().await;
        coordinator.trigger();
        wait_a.await.unwrap();
        wait_b.await.unwrap();
    }
}
