//! Server push to every open session.

use std::sync::Arc;
use std::time::Duration;

use babel_protocol::Broadcast;
use babel_reconcile::SpecHash;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::fleet::{Fleet, FleetEvent};
use crate::registry::Registry;

pub const REGISTRY: &str = "registry";
pub const CLOCK: &str = "clock";
pub const NODE_EVENT: &str = "node event";

/// Fan-in point for everything pushed to sessions.
#[derive(Clone)]
pub struct Broadcasts {
    tx: broadcast::Sender<Broadcast>,
}

impl Default for Broadcasts {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcasts {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }

    /// Returns how many sessions received it.
    pub fn publish(&self, message: Broadcast) -> usize {
        self.tx.send(message).unwrap_or(0)
    }
}

/// Periodic registry diff, clock tick and node event forwarding.
pub struct Broadcaster {
    registry: Arc<Registry>,
    fleet: Arc<Fleet>,
    broadcasts: Broadcasts,
    interval: Duration,
    last: Option<SpecHash>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<Registry>,
        fleet: Arc<Fleet>,
        broadcasts: Broadcasts,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            fleet,
            broadcasts,
            interval,
            last: None,
        }
    }

    /// Publish the registry view if it changed since the last call.
    pub fn publish_registry_diff(&mut self) -> bool {
        let snapshot = self.registry.snapshot();
        let hash = SpecHash::from_json(&snapshot);
        if self.last.as_ref() == Some(&hash) {
            return false;
        }
        debug!(hash = %hash, "Registry changed");
        self.last = Some(hash);
        self.broadcasts.publish(Broadcast::new(REGISTRY, snapshot));
        true
    }

    fn publish_clock(&self) {
        self.broadcasts
            .publish(Broadcast::new(CLOCK, json!({ "now": Utc::now().to_rfc3339() })));
    }

    fn forward(&self, event: FleetEvent) {
        self.broadcasts.publish(Broadcast::new(
            NODE_EVENT,
            json!({
                "lang": event.lang,
                "event": event.event.event,
                "data": event.event.data,
            }),
        ));
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting broadcaster");

        let mut events = self.fleet.subscribe();
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.publish_registry_diff();
                    self.publish_clock();
                }
                event = events.recv() => match event {
                    Ok(event) => self.forward(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Broadcaster lagged behind node events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Node event channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Broadcaster shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logring::LogRing;

    #[tokio::test]
    async fn registry_diff_only_on_change() {
        let registry = Arc::new(Registry::new(LogRing::new(8)));
        let fleet = Arc::new(Fleet::new(Duration::from_secs(1)));
        let broadcasts = Broadcasts::default();
        let mut rx = broadcasts.subscribe();
        let mut broadcaster =
            Broadcaster::new(registry.clone(), fleet, broadcasts, Duration::from_secs(1));

        assert!(broadcaster.publish_registry_diff());
        assert!(!broadcaster.publish_registry_diff());

        registry.set_infrastructure_locked(true);
        assert!(broadcaster.publish_registry_diff());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.broadcast, REGISTRY);
        assert_eq!(first.data["infrastructure_locked"], false);
        assert_eq!(second.data["infrastructure_locked"], true);
        assert!(rx.try_recv().is_err());
    }
}
