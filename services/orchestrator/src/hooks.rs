//! Post-command notifications.
//!
//! Every dispatched command produces one [`CommandCompleted`]. It is logged,
//! then handed to the registered hooks: inline hooks run on the calling task,
//! detached hooks are queued to a fixed pool of workers. A full queue drops
//! the notification with a warning; the command path never waits for it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of one command, as seen by hooks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandCompleted {
    pub command: String,
    pub lang: Option<String>,
    pub caller: String,
    pub status: bool,
    pub message: String,
    pub elapsed_ms: u64,
}

#[async_trait]
pub trait CommandHook: Send + Sync {
    fn id(&self) -> &str;

    /// Run on the worker pool instead of the calling task.
    fn detached(&self) -> bool {
        false
    }

    async fn on_command_completed(&self, event: &CommandCompleted);
}

type Job = (Arc<dyn CommandHook>, Arc<CommandCompleted>);

/// Registered hooks plus the worker pool for detached ones.
pub struct Hooks {
    hooks: RwLock<Vec<Arc<dyn CommandHook>>>,
    queue: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl Hooks {
    /// Spawn `workers` tasks sharing a queue of `capacity` jobs.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (queue, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        // Hold the receiver only while taking one job.
                        let job = rx.lock().await.recv().await;
                        let Some((hook, event)) = job else { break };
                        debug!(worker, hook = hook.id(), "Running detached hook");
                        run_hook(hook.as_ref(), &event).await;
                    }
                })
            })
            .collect();

        Self {
            hooks: RwLock::new(Vec::new()),
            queue,
            workers,
        }
    }

    pub fn register(&self, hook: Arc<dyn CommandHook>) {
        info!(hook = hook.id(), detached = hook.detached(), "Registered command hook");
        self.hooks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(hook);
    }

    /// Log the outcome and notify every hook.
    pub async fn command_completed(&self, event: CommandCompleted) {
        if event.status {
            info!(
                command = %event.command,
                lang = event.lang.as_deref().unwrap_or(""),
                caller = %event.caller,
                elapsed_ms = event.elapsed_ms,
                "Command completed"
            );
        } else {
            warn!(
                command = %event.command,
                lang = event.lang.as_deref().unwrap_or(""),
                caller = %event.caller,
                elapsed_ms = event.elapsed_ms,
                message = %event.message,
                "Command failed"
            );
        }

        let hooks: Vec<Arc<dyn CommandHook>> = self
            .hooks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if hooks.is_empty() {
            return;
        }

        let event = Arc::new(event);
        for hook in hooks {
            if hook.detached() {
                if let Err(e) = self.queue.try_send((hook.clone(), event.clone())) {
                    warn!(hook = hook.id(), error = %e, "Hook queue full, dropping notification");
                }
            } else {
                run_hook(hook.as_ref(), &event).await;
            }
        }
    }
}

/// A panicking hook is logged and otherwise ignored.
async fn run_hook(hook: &dyn CommandHook, event: &CommandCompleted) {
    let outcome = AssertUnwindSafe(hook.on_command_completed(event))
        .catch_unwind()
        .await;
    if outcome.is_err() {
        error!(hook = hook.id(), command = %event.command, "Command hook panicked");
    }
}

impl Drop for Hooks {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}
