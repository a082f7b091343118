//! Media timeline: named media fired at fixed offsets from a start point.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use babel_scheduler::{DelayScheduler, SchedulerConfig};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const TIMELINE_TAG: &str = "timeline";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: usize,
    pub name: String,
    /// Seconds from the timeline origin.
    pub timestamp: f64,
    pub played: bool,
    pub failed: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum TimingError {
    #[error("timestamp {0} is not a non-negative number of seconds")]
    InvalidTimestamp(f64),

    #[error("offset {0} is not a finite number of seconds")]
    InvalidOffset(f64),

    #[error("entry at {timestamp}s is out of range from offset {offset}s")]
    OutOfRange { timestamp: f64, offset: f64 },
}

/// Invoked when an entry fires; resolves to whether playback succeeded.
pub type TimelineCallback = Arc<dyn Fn(TimelineEntry) -> BoxFuture<'static, bool> + Send + Sync>;

pub struct Timing {
    scheduler: DelayScheduler,
    entries: Arc<Mutex<Vec<TimelineEntry>>>,
    callback: TimelineCallback,
}

fn lock(entries: &Mutex<Vec<TimelineEntry>>) -> MutexGuard<'_, Vec<TimelineEntry>> {
    entries.lock().unwrap_or_else(|p| p.into_inner())
}

impl Timing {
    pub fn new(callback: TimelineCallback) -> Self {
        Self {
            scheduler: DelayScheduler::new(SchedulerConfig {
                name: "timing".into(),
                ..Default::default()
            }),
            entries: Arc::new(Mutex::new(Vec::new())),
            callback,
        }
    }

    /// Start the scheduler worker.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.scheduler.spawn(shutdown)
    }

    /// Replace the timeline. Pending timers are cancelled.
    ///
    /// Nothing changes when any timestamp is negative or not representable.
    pub fn set(&self, entries: Vec<(String, f64)>) -> Result<usize, TimingError> {
        if let Some(&(_, bad)) = entries
            .iter()
            .find(|(_, ts)| Duration::try_from_secs_f64(*ts).is_err())
        {
            return Err(TimingError::InvalidTimestamp(bad));
        }
        self.stop();
        let mut timeline: Vec<TimelineEntry> = entries
            .into_iter()
            .map(|(name, timestamp)| TimelineEntry {
                id: 0,
                name,
                timestamp,
                played: false,
                failed: false,
            })
            .collect();
        timeline.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        for (id, entry) in timeline.iter_mut().enumerate() {
            entry.id = id;
        }

        let count = timeline.len();
        *lock(&self.entries) = timeline;
        info!(entries = count, "Timeline set");
        Ok(count)
    }

    /// Schedule every unplayed entry relative to `offset` seconds into the
    /// timeline. Entries before the offset count as played.
    ///
    /// Every delay is computed before anything is cancelled, so a rejected
    /// start leaves the running timeline untouched.
    pub fn start(&self, offset: f64) -> Result<usize, TimingError> {
        if !offset.is_finite() {
            return Err(TimingError::InvalidOffset(offset));
        }

        let pending: Vec<(TimelineEntry, Duration)> = {
            let entries = lock(&self.entries);
            let pending: Result<Vec<_>, TimingError> = entries
                .iter()
                .filter(|e| !e.played && e.timestamp >= offset)
                .map(|e| {
                    Duration::try_from_secs_f64(e.timestamp - offset)
                        .map(|delay| (e.clone(), delay))
                        .map_err(|_| TimingError::OutOfRange {
                            timestamp: e.timestamp,
                            offset,
                        })
                })
                .collect();
            pending?
        };

        self.stop();
        for entry in lock(&self.entries).iter_mut().filter(|e| e.timestamp < offset) {
            entry.played = true;
        }

        for (entry, delay) in &pending {
            let delay = *delay;
            let entries = self.entries.clone();
            let callback = self.callback.clone();
            let id = entry.id;
            self.scheduler.schedule_tagged(TIMELINE_TAG, delay, move || async move {
                let fired = {
                    let mut timeline = lock(&entries);
                    let Some(entry) = timeline.iter_mut().find(|e| e.id == id) else {
                        return anyhow::Ok(());
                    };
                    entry.played = true;
                    entry.clone()
                };
                info!(id, name = %fired.name, timestamp = fired.timestamp, "Timeline entry fired");

                let ok = callback(fired).await;
                if !ok {
                    warn!(id, "Timeline entry failed to play");
                    if let Some(entry) = lock(&entries).iter_mut().find(|e| e.id == id) {
                        entry.failed = true;
                    }
                }
                anyhow::Ok(())
            });
        }

        info!(offset, scheduled = pending.len(), "Timeline started");
        Ok(pending.len())
    }

    pub fn stop(&self) -> usize {
        let cancelled = self.scheduler.cancel_all(TIMELINE_TAG);
        if cancelled > 0 {
            info!(cancelled, "Timeline stopped");
        }
        cancelled
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        lock(&self.entries).clone()
    }

    /// Entries still waiting to fire.
    pub fn pending(&self) -> usize {
        self.scheduler.pending_tagged(TIMELINE_TAG)
    }
}
