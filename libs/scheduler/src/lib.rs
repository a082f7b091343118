//! Delay scheduler.
//!
//! A list of pending callbacks, each fired once its delay has elapsed, driven
//! by one background worker per owning subsystem. Entries may carry a tag so
//! that related callbacks can be cancelled together.
//!
//! # Delays
//!
//! A [`Delay`] is either fixed or a closure re-evaluated on every check. The
//! worker sleeps until the earliest fixed deadline and falls back to polling
//! at [`SchedulerConfig::poll_interval`] while any dynamic entry is pending.
//!
//! # Invariants
//!
//! - An action runs at most once.
//! - After `cancel_all(tag)` returns, no entry scheduled under `tag` before
//!   the call will start, even if the worker had already collected it.
//!   `clear()` gives the same guarantee for every entry, tagged or not.
//! - Actions run outside the internal lock and may call back into the
//!   scheduler.
//! - A failing or panicking action is logged and never stops the worker.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use babel_id::TimerId;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type Action = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type DelayFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// How long an entry waits before firing.
#[derive(Clone)]
pub enum Delay {
    /// Fire once this much time has passed since scheduling.
    Fixed(Duration),
    /// Re-evaluated at every check.
    Dynamic(DelayFn),
}

impl Delay {
    /// A delay computed lazily from state that may not exist yet.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Delay::Dynamic(Arc::new(f))
    }

    fn resolve(&self) -> Duration {
        match self {
            Delay::Fixed(d) => *d,
            Delay::Dynamic(f) => f(),
        }
    }
}

impl From<Duration> for Delay {
    fn from(d: Duration) -> Self {
        Delay::Fixed(d)
    }
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Delay::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name used in log lines.
    pub name: String,
    /// Check interval while dynamic delays are pending.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "scheduler".to_string(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

struct Entry {
    id: TimerId,
    tag: Option<String>,
    generation: u64,
    epoch: u64,
    scheduled_at: Instant,
    delay: Delay,
    action: Action,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    /// Bumped by `cancel_all`; entries from an older generation never run.
    generations: HashMap<String, u64>,
    /// Bumped by `clear`, which outdates every entry.
    epoch: u64,
}

impl State {
    fn generation(&self, tag: Option<&str>) -> u64 {
        tag.and_then(|t| self.generations.get(t).copied())
            .unwrap_or_default()
    }

    fn is_current(&self, entry: &Entry) -> bool {
        entry.epoch == self.epoch && entry.generation == self.generation(entry.tag.as_deref())
    }
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<State>,
    wake: Notify,
}

/// Handle to a delay scheduler. Clones share the same entry list.
#[derive(Clone)]
pub struct DelayScheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for DelayScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayScheduler")
            .field("name", &self.inner.config.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for DelayScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl DelayScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                wake: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned list is still structurally valid.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule an untagged action.
    pub fn schedule<F, Fut>(&self, delay: impl Into<Delay>, action: F) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(None, delay.into(), action)
    }

    /// Schedule an action under `tag`.
    pub fn schedule_tagged<F, Fut>(
        &self,
        tag: impl Into<String>,
        delay: impl Into<Delay>,
        action: F,
    ) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(Some(tag.into()), delay.into(), action)
    }

    fn insert<F, Fut>(&self, tag: Option<String>, delay: Delay, action: F) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = TimerId::new();
        {
            let mut state = self.lock();
            let generation = state.generation(tag.as_deref());
            let epoch = state.epoch;
            debug!(
                scheduler = %self.inner.config.name,
                timer_id = %id,
                tag = tag.as_deref().unwrap_or(""),
                ?delay,
                "Scheduled callback"
            );
            state.entries.push(Entry {
                id,
                tag,
                generation,
                epoch,
                scheduled_at: Instant::now(),
                delay,
                action: Box::new(move || action().boxed()),
            });
        }
        self.inner.wake.notify_one();
        id
    }

    /// Remove every pending entry carrying `tag`. Returns how many were removed.
    pub fn cancel_all(&self, tag: &str) -> usize {
        let mut state = self.lock();
        *state.generations.entry(tag.to_string()).or_default() += 1;
        let before = state.entries.len();
        state.entries.retain(|e| e.tag.as_deref() != Some(tag));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(scheduler = %self.inner.config.name, tag, removed, "Cancelled callbacks");
        }
        removed
    }

    /// Remove a single entry.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        before != state.entries.len()
    }

    /// Remove everything, tagged or not.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.entries.clear();
    }

    /// Number of entries not yet fired.
    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    /// Number of pending entries under `tag`.
    pub fn pending_tagged(&self, tag: &str) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.tag.as_deref() == Some(tag))
            .count()
    }

    /// When the worker should next look at the list.
    fn next_wake(&self) -> Option<Instant> {
        let state = self.lock();
        let now = Instant::now();
        let mut next: Option<Instant> = None;
        for entry in &state.entries {
            let at = match &entry.delay {
                Delay::Fixed(d) => entry.scheduled_at + *d,
                Delay::Dynamic(_) => now + self.inner.config.poll_interval,
            };
            next = Some(next.map_or(at, |n| n.min(at)));
        }
        next
    }

    /// Fire every entry whose delay has elapsed. Returns how many ran.
    pub async fn fire_due(&self) -> usize {
        let now = Instant::now();

        // Dynamic delays are user code; evaluate them without holding the lock.
        let candidates: Vec<(TimerId, Instant, Delay)> = self
            .lock()
            .entries
            .iter()
            .map(|e| (e.id, e.scheduled_at, e.delay.clone()))
            .collect();
        let due: Vec<TimerId> = candidates
            .into_iter()
            .filter(|(_, at, delay)| now.saturating_duration_since(*at) >= delay.resolve())
            .map(|(id, _, _)| id)
            .collect();
        if due.is_empty() {
            return 0;
        }

        let fired: Vec<Entry> = {
            let mut state = self.lock();
            let (fired, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|e| due.contains(&e.id));
            state.entries = kept;
            fired
        };

        let mut ran = 0;
        for entry in fired {
            if !self.lock().is_current(&entry) {
                continue;
            }
            ran += 1;
            self.run_action(entry).await;
        }
        ran
    }

    async fn run_action(&self, entry: Entry) {
        let name = &self.inner.config.name;
        let fut = (entry.action)();
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(scheduler = %name, timer_id = %entry.id, error = %e, "Scheduled callback failed");
            }
            Err(_) => {
                error!(scheduler = %name, timer_id = %entry.id, "Scheduled callback panicked");
            }
        }
    }

    /// Drive the scheduler until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(scheduler = %self.inner.config.name, "Starting delay scheduler");

        loop {
            let wake_at = self.next_wake();
            let sleep = async move {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sleep => {
                    self.fire_due().await;
                }
                _ = self.inner.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(scheduler = %self.inner.config.name, "Delay scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    }
}
