//! Workflow engines
//!
//! An [`Engine`] owns one run of the installer. It is the only writer of the
//! event queue and the only reader of the action queue; returning from
//! [`Engine::run`] drops its [`EventSink`] and thereby closes the queue.
//!
//! Two engines exist:
//!
//! | Engine            | Purpose |
//! |-------------------|---------|
//! | [`InstallEngine`] | The real workflow: probes, database, supervised install, extras |
//! | [`DemoEngine`]    | Timed simulation of the quest track for front-end work |

pub mod admin;
pub mod database;
pub mod demo;
pub mod extras;
pub mod install;
pub mod preflight;
pub mod runtime;
pub mod self_update;
pub mod session;

pub use demo::{DemoEngine, DemoOptions};
pub use install::InstallEngine;
pub use session::Session;

use crate::protocol::{ActionSource, EventSink};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A runnable workflow.
#[async_trait]
pub trait Engine: Send {
    /// Drive the workflow until it completes, halts or `cancel` fires.
    async fn run(self: Box<Self>, sink: EventSink, actions: ActionSource, cancel: CancellationToken);
}

/// Run `engine` on a background task.
pub fn spawn(
    engine: Box<dyn Engine>,
    sink: EventSink,
    actions: ActionSource,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move { engine.run(sink, actions, cancel).await })
}
