//! Daemon/Watcher (C10) and RPC Surface (C12): the long-running half
//! of shadowdog, driving `shadowdog_core::generator::Drive` from
//! filesystem-change and RPC triggers (spec.md §4.10, §6).

pub mod daemon;
mod notify_channel;
pub mod rpc;
mod shutdown;
mod watcher;

pub use daemon::Daemon;
pub use notify_channel::{NotifyChannel, NotifyEvent};
pub use shutdown::{ShutdownCoordinator, install_signal_handlers};
pub use watcher::{WatchSet, WatchTrigger};
