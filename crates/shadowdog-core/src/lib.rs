//! Core build engine for shadowdog: the Cache Key, File Resolver,
//! Artifact Codec, Task Runner, Process Supervisor, Cache Middlewares,
//! Command Plugins, Generator, and Lock File Writer (C1-C7, C9, C11).
//!
//! The Daemon/Watcher (C10) and RPC Surface (C12) live in
//! `shadowdog-daemon`, which drives this crate's `generator::Drive`
//! from filesystem-change and RPC triggers.

pub mod cache;
pub mod cache_key;
pub mod codec;
pub mod config;
pub mod content_hash;
pub mod error;
pub mod generator;
pub mod lockfile;
pub mod plugins;
pub mod resolver;
pub mod runner;
pub mod supervisor;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use generator::{Drive, GenerateOptions};
pub use lockfile::LockWriter;
