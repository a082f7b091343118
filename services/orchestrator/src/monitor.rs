//! Periodic re-activation of languages whose node dropped or that still have
//! modified settings.
//!
//! Reconnecting is retried every tick with no backoff; a language that keeps
//! failing is only logged louder.

use std::time::Duration;

use babel_reconcile::FailureTracker;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::registry::Lifecycle;
use crate::state::AppState;

pub struct FleetMonitor {
    state: AppState,
    interval: Duration,
    failures: FailureTracker,
}

impl FleetMonitor {
    pub fn new(state: AppState, interval: Duration) -> Self {
        Self {
            state,
            interval,
            failures: FailureTracker::default(),
        }
    }

    /// Languages needing a round: disconnected or with unpushed changes.
    pub fn stale_languages(&self) -> Vec<String> {
        let registry = self.state.registry();
        let fleet = self.state.fleet();
        registry
            .list_languages()
            .into_iter()
            .filter(|lang| {
                let connected = fleet.get(lang).is_some_and(|m| m.is_connected());
                let pending = registry.language(lang).is_some_and(|t| t.needs_push());
                !connected || pending
            })
            .collect()
    }

    /// One pass. Returns how many languages were retried.
    pub async fn tick(&mut self) -> usize {
        if self.state.registry().lifecycle() != Lifecycle::Running {
            return 0;
        }
        let stale = self.stale_languages();
        if stale.is_empty() {
            return 0;
        }
        debug!(langs = ?stale, "Re-activating stale languages");

        let result = self.state.activator().activate(&stale).await;
        let per_lang = result.serializable_object.unwrap_or_default();
        for lang in &stale {
            let ok = per_lang
                .get(lang)
                .and_then(|r| r.get("status"))
                .and_then(|s| s.as_bool())
                .unwrap_or(false);
            if ok {
                let streak = self.failures.clear(lang);
                if streak > 0 {
                    info!(lang = %lang, failures = streak, "Node recovered");
                }
                continue;
            }

            let streak = self.failures.record_failure(lang);
            let reason = per_lang
                .get(lang)
                .and_then(|r| r.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("no outcome");
            if self.failures.is_exhausted(lang) {
                error!(lang = %lang, failures = streak, reason, "Node keeps failing");
            } else {
                warn!(lang = %lang, failures = streak, reason, "Node re-activation failed");
            }
        }
        stale.len()
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting fleet monitor");

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Fleet monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
