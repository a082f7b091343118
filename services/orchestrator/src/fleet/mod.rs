//! Fleet RPC: one control channel per language node.

mod minion;
mod rpc;

pub use minion::MinionProxy;
pub use rpc::{wait_for_all, ResponseHandle};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use babel_protocol::{CommandResult, NodeEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FleetError {
    #[error("cannot connect to {lang} node at {endpoint}: {reason}")]
    Connect {
        lang: String,
        endpoint: String,
        reason: String,
    },

    #[error("{0} node is not connected")]
    NotConnected(String),

    #[error("NodeDidNotRespond: {lang} ({reason})")]
    NodeDidNotRespond { lang: String, reason: String },
}

/// An unsolicited event from a node, tagged with its language.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetEvent {
    pub lang: String,
    pub event: NodeEvent,
}

/// Persisted node-proxy list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub lang: String,
    pub endpoint: String,
}

/// All node proxies, keyed by language.
pub struct Fleet {
    minions: Mutex<HashMap<String, Arc<MinionProxy>>>,
    events: broadcast::Sender<FleetEvent>,
    rpc_timeout: Duration,
}

impl Fleet {
    pub fn new(rpc_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            minions: Mutex::new(HashMap::new()),
            events,
            rpc_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MinionProxy>>> {
        self.minions.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, lang: &str) -> Option<Arc<MinionProxy>> {
        self.lock().get(lang).cloned()
    }

    pub fn is_connected(&self, lang: &str, endpoint: &str) -> bool {
        self.get(lang)
            .is_some_and(|m| m.is_connected() && m.endpoint() == endpoint)
    }

    /// Connect `lang`, reusing a live channel to the same endpoint.
    pub async fn connect(&self, lang: &str, endpoint: &str) -> Result<Arc<MinionProxy>, FleetError> {
        if let Some(existing) = self.get(lang) {
            if existing.is_connected() && existing.endpoint() == endpoint {
                return Ok(existing);
            }
        }

        let proxy = Arc::new(
            MinionProxy::connect(lang, endpoint, self.events.clone(), self.rpc_timeout).await?,
        );
        if let Some(old) = self.lock().insert(lang.to_string(), proxy.clone()) {
            old.close();
        }
        Ok(proxy)
    }

    pub fn disconnect(&self, lang: &str) -> bool {
        match self.lock().remove(lang) {
            Some(proxy) => {
                proxy.close();
                info!(lang, "Disconnected node");
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (lang, proxy) in drained {
            proxy.close();
            info!(lang = %lang, "Disconnected node");
        }
    }

    pub fn records(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self
            .lock()
            .values()
            .map(|m| NodeRecord {
                lang: m.lang().to_string(),
                endpoint: m.endpoint().to_string(),
            })
            .collect();
        records.sort_by(|a, b| a.lang.cmp(&b.lang));
        records
    }

    /// Send one command to every language and AND-reduce the replies.
    pub async fn broadcast(
        &self,
        langs: &[String],
        command: &str,
        details: Option<Value>,
    ) -> CommandResult {
        CommandResult::aggregate(self.fan_out(langs, command, details).await)
    }

    /// Send one command to every language, bounded by the RPC timeout.
    pub async fn fan_out(
        &self,
        langs: &[String],
        command: &str,
        details: Option<Value>,
    ) -> BTreeMap<String, CommandResult> {
        let handles = langs
            .iter()
            .map(|lang| match self.get(lang) {
                Some(minion) => minion.command(command, details.clone()),
                None => ResponseHandle::resolved(
                    lang,
                    CommandResult::failure(FleetError::NotConnected(lang.clone()).to_string()),
                ),
            })
            .collect();
        wait_for_all(handles, self.rpc_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use babel_protocol::commands;
    use babel_testing::{Behavior, FakeNode};
    use serde_json::json;

    #[tokio::test]
    async fn connect_failure_is_immediate() {
        let fleet = Fleet::new(Duration::from_millis(500));
        // Nothing listens on port 1.
        let err = fleet.connect("Fra", "127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, FleetError::Connect { .. }));
        assert!(fleet.get("Fra").is_none());
    }

    #[tokio::test]
    async fn fan_out_reports_every_language() {
        let deu = FakeNode::start().await.unwrap();
        let fra = FakeNode::with_default(Behavior::Silent).await.unwrap();
        let fleet = Fleet::new(Duration::from_millis(300));
        fleet.connect("Deu", &deu.endpoint()).await.unwrap();
        fleet.connect("Fra", &fra.endpoint()).await.unwrap();

        let langs = vec!["Deu".to_string(), "Fra".to_string(), "Ita".to_string()];
        let result = fleet
            .broadcast(&langs, commands::node::PING, Some(json!({})))
            .await;

        assert!(!result.status);
        let per_lang = result.serializable_object.unwrap();
        assert_eq!(per_lang["Deu"]["status"], true);
        assert!(per_lang["Fra"]["message"]
            .as_str()
            .unwrap()
            .starts_with("NodeDidNotRespond"));
        assert_eq!(per_lang["Ita"]["status"], false);
    }

    #[tokio::test]
    async fn reconnect_reuses_live_channel() {
        let node = FakeNode::start().await.unwrap();
        let fleet = Fleet::new(Duration::from_millis(300));
        let a = fleet.connect("Deu", &node.endpoint()).await.unwrap();
        let b = fleet.connect("Deu", &node.endpoint()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert_eq!(fleet.records(), vec![NodeRecord {
            lang: "Deu".into(),
            endpoint: node.endpoint(),
        }]);
        assert!(fleet.disconnect("Deu"));
        assert!(!a.is_connected());
    }
}
