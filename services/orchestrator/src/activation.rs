//! Activation: push every modified settings tree to its node.
//!
//! One round at a time. A round provisions the requested languages, makes
//! sure each node's control channel is up (activating the connection subject
//! first), pushes the trees that still have modified subjects in parallel and
//! records the revisions each node confirmed. The registry lock is only taken
//! for the short reads and writes around the network waits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use babel_id::Revision;
use babel_protocol::CommandResult;
use babel_settings::SubjectKind;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::CommandError;
use crate::fleet::{wait_for_all, Fleet, ResponseHandle};
use crate::infrastructure::{split_endpoint, Infrastructure};
use crate::registry::Registry;

pub struct Activator {
    registry: Arc<Registry>,
    infrastructure: Arc<Infrastructure>,
    fleet: Arc<Fleet>,
    round: Mutex<()>,
}

enum Prepared {
    Push(ResponseHandle, Vec<(SubjectKind, Revision)>),
    UpToDate,
}

impl Activator {
    pub fn new(registry: Arc<Registry>, infrastructure: Arc<Infrastructure>, fleet: Arc<Fleet>) -> Self {
        Self {
            registry,
            infrastructure,
            fleet,
            round: Mutex::new(()),
        }
    }

    /// Held by callers that must not interleave with a round (dispose).
    pub async fn exclusive(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.round.lock().await
    }

    /// Activate `langs` and AND-reduce the per-language outcomes.
    #[instrument(skip(self), fields(langs = ?langs))]
    pub async fn activate(&self, langs: &[String]) -> CommandResult {
        let _round = self.round.lock().await;

        let mut outcomes = BTreeMap::new();
        let mut handles = Vec::new();
        let mut pushed: HashMap<String, Vec<(SubjectKind, Revision)>> = HashMap::new();

        for (lang, endpoint) in self.infrastructure.ensure(langs).await {
            let endpoint = match endpoint {
                Ok(endpoint) => endpoint,
                Err(reason) => {
                    warn!(lang = %lang, %reason, "Node unavailable");
                    outcomes.insert(lang, CommandResult::failure(reason));
                    continue;
                }
            };

            match self.prepare(&lang, &endpoint).await {
                Ok(Prepared::Push(handle, revisions)) => {
                    handles.push(handle);
                    pushed.insert(lang, revisions);
                }
                Ok(Prepared::UpToDate) => {
                    outcomes.insert(lang, CommandResult::ok("already active"));
                }
                Err(e) => {
                    warn!(lang = %lang, error = %e, "Activation failed before push");
                    outcomes.insert(lang, CommandResult::failure(e.to_string()));
                }
            }
        }

        for (lang, reply) in wait_for_all(handles, self.fleet.rpc_timeout()).await {
            let outcome = if reply.status {
                let revisions = pushed.get(&lang).map(Vec::as_slice).unwrap_or_default();
                match self.registry.record_activation(&lang, revisions) {
                    Ok(activated) => {
                        info!(lang = %lang, activated, "Settings activated");
                        reply
                    }
                    Err(e) => CommandResult::failure(e.to_string()),
                }
            } else {
                warn!(lang = %lang, message = %reply.message, "Node rejected settings");
                reply
            };
            outcomes.insert(lang, outcome);
        }

        CommandResult::aggregate(outcomes)
    }

    /// Connect `lang` to `endpoint` and start its push if one is needed.
    async fn prepare(&self, lang: &str, endpoint: &str) -> Result<Prepared, CommandError> {
        let (host, port) = split_endpoint(endpoint)
            .ok_or_else(|| anyhow::anyhow!("invalid node endpoint '{endpoint}'"))?;
        let target = self.registry.set_connection(lang, &host, port)?;

        if !target.active || !self.fleet.is_connected(lang, endpoint) {
            self.fleet.connect(lang, endpoint).await?;
            // A fresh channel may lead to a fresh node: push everything again.
            self.registry.deactivate_all(lang);
            if !self.registry.mark_connection_active(lang, target.revision) {
                return Err(anyhow::anyhow!("connection settings changed during activation").into());
            }
            debug!(lang, endpoint, "Connection active");
        }

        let Some(push) = self.registry.pending_push(lang)? else {
            return Ok(Prepared::UpToDate);
        };
        let minion = self
            .fleet
            .get(lang)
            .ok_or_else(|| crate::fleet::FleetError::NotConnected(lang.to_string()))?;
        Ok(Prepared::Push(minion.apply_config(push.payload), push.revisions))
    }
}
