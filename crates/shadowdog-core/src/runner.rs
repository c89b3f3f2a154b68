//! Task Runner (C4): an ordered middleware chain around a terminal
//! executor, with `next`/`abort` semantics (spec.md §4.4).
//!
//! Modeled per spec.md §9's own prescription: a trait with an
//! `invoke(ctx, next)` method and a heap-allocated chain, where `next`
//! captures the remainder of the chain. Grounded in shape on the
//! teacher's async-trait middleware-like patterns in `crates/services`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{Command, RelativePath};
use shadowdog_events::EventBus;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whether the chain ran through to the terminal executor or was
/// short-circuited by a middleware's `abort()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Aborted,
}

/// The shared, read-mostly view every middleware and the terminal
/// executor see. Only `options` fields a middleware privately owns are
/// meant to be mutated by that middleware; the rest is read-only by
/// convention (spec.md §4.4: "every middleware sees the same `ctx`
/// view").
pub struct RunContext {
    pub files: Vec<RelativePath>,
    pub environment_names: Vec<String>,
    pub command: Command,
    pub project_root: PathBuf,
    pub changed_file_path: Option<PathBuf>,
    pub event_bus: Arc<EventBus>,
    pub cancellation: CancellationToken,
    aborted: AtomicBool,
}

impl RunContext {
    #[must_use]
    pub fn new(
        files: Vec<RelativePath>,
        environment_names: Vec<String>,
        command: Command,
        project_root: PathBuf,
        changed_file_path: Option<PathBuf>,
        event_bus: Arc<EventBus>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            files,
            environment_names,
            command,
            project_root,
            changed_file_path,
            event_bus,
            cancellation,
            aborted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn set_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// The terminal frame, innermost of the chain (the Process Supervisor
/// call in production).
pub type Terminal = dyn for<'a> Fn(&'a mut RunContext) -> BoxFuture<'a, Result<()>> + Send + Sync;

/// A composable wrapper around the terminal command executor.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn invoke(&self, ctx: &mut RunContext, next: Next<'_>) -> Result<Outcome>;
}

/// The remainder of the chain, captured for a middleware to delegate
/// to (`next.call(ctx)`) or to short-circuit (`next.abort(ctx)`).
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    /// Delegate to the rest of the chain (and eventually the terminal
    /// executor). Middlewares execute in registration order; the
    /// terminal executor is the innermost frame.
    pub async fn call(self, ctx: &mut RunContext) -> Result<Outcome> {
        if ctx.is_aborted() {
            return Ok(Outcome::Aborted);
        }
        run_from(self.middlewares, ctx, self.terminal).await
    }

    /// Short-circuit: skip the rest of the chain and the terminal
    /// executor. Sticky — once set, no further frame is entered.
    pub fn abort(self, ctx: &mut RunContext) -> Outcome {
        ctx.set_aborted();
        Outcome::Aborted
    }
}

fn run_from<'a>(
    middlewares: &'a [Arc<dyn Middleware>],
    ctx: &'a mut RunContext,
    terminal: &'a Terminal,
) -> BoxFuture<'a, Result<Outcome>> {
    Box::pin(async move {
        if ctx.is_aborted() {
            return Ok(Outcome::Aborted);
        }
        match middlewares.split_first() {
            None => {
                terminal(ctx).await?;
                Ok(Outcome::Continue)
            }
            Some((head, rest)) => {
                let next = Next {
                    middlewares: rest,
                    terminal,
                };
                head.invoke(ctx, next).await
            }
        }
    })
}

/// Composes a stack of middlewares around a terminal executor.
pub struct TaskRunner {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl TaskRunner {
    #[must_use]
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    /// Drive the chain to completion. Cancellation of `ctx.cancellation`
    /// races the whole recursive chain: dropping that single future
    /// unwinds every frame that has called `next()`, since they are
    /// all nested awaits within one future (spec.md §4.4's "cancellation
    /// ... must unwind every frame that has `next()`ed").
    pub async fn run(&self, ctx: &mut RunContext, terminal: &Terminal) -> Result<Outcome> {
        let cancellation = ctx.cancellation.clone();
        tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(Error::command_failed(-1, "task cancelled: superseded by a newer run")),
            result = run_from(&self.middlewares, ctx, terminal) => result,
        }
    }
}
