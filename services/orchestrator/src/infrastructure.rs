//! Node provisioning collaborator and the topology it produced.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Supplies nodes for languages.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Request nodes; returns `(lang, host:port)` for what it could provide.
    async fn provision(&self, langs: &[String]) -> anyhow::Result<Vec<(String, String)>>;

    /// Whether the node for `lang` is ready to accept a control channel.
    async fn is_provisioned(&self, lang: &str) -> bool;

    /// Give nodes back.
    async fn release(&self, langs: &[String]) -> anyhow::Result<()>;
}

/// A fixed `lang -> host:port` table, e.g. from `BABEL_NODES`.
#[derive(Debug, Clone, Default)]
pub struct StaticProvisioner {
    nodes: BTreeMap<String, String>,
}

impl StaticProvisioner {
    pub fn new(nodes: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn provision(&self, langs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
        Ok(langs
            .iter()
            .filter_map(|lang| self.nodes.get(lang).map(|ep| (lang.clone(), ep.clone())))
            .collect())
    }

    async fn is_provisioned(&self, lang: &str) -> bool {
        self.nodes.contains_key(lang)
    }

    async fn release(&self, _langs: &[String]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Persisted topology: which endpoint serves which language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

/// Provisioning state of the whole fleet.
pub struct Infrastructure {
    provisioner: Box<dyn Provisioner>,
    topology: Mutex<Topology>,
    timeout: Duration,
    poll_interval: Duration,
}

impl Infrastructure {
    pub fn new(provisioner: Box<dyn Provisioner>, timeout: Duration) -> Self {
        Self {
            provisioner,
            topology: Mutex::new(Topology::default()),
            timeout,
            poll_interval: Duration::from_millis(500),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn endpoint(&self, lang: &str) -> Option<String> {
        self.lock().endpoints.get(lang).cloned()
    }

    pub fn topology(&self) -> Topology {
        self.lock().clone()
    }

    pub fn restore(&self, topology: Topology) {
        *self.lock() = topology;
    }

    /// Make sure every language has a ready node.
    ///
    /// Blocks until all of them report provisioned or the provisioning
    /// timeout elapses; each language gets its endpoint or a reason.
    pub async fn ensure(&self, langs: &[String]) -> BTreeMap<String, Result<String, String>> {
        let deadline = Instant::now() + self.timeout;

        let missing: Vec<String> = {
            let topology = self.lock();
            langs
                .iter()
                .filter(|l| !topology.endpoints.contains_key(*l))
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            info!(langs = ?missing, "Provisioning nodes");
            match tokio::time::timeout_at(deadline, self.provisioner.provision(&missing)).await {
                Ok(Ok(provided)) => {
                    let mut topology = self.lock();
                    for (lang, endpoint) in provided {
                        topology.endpoints.insert(lang, endpoint);
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "Provisioning failed"),
                Err(_) => warn!("Provisioning timed out"),
            }
        }

        let mut outcome = BTreeMap::new();
        for lang in langs {
            let Some(endpoint) = self.endpoint(lang) else {
                outcome.insert(lang.clone(), Err("no node provisioned".to_string()));
                continue;
            };
            let ready = loop {
                if self.provisioner.is_provisioned(lang).await {
                    break true;
                }
                if Instant::now() + self.poll_interval > deadline {
                    break false;
                }
                tokio::time::sleep(self.poll_interval).await;
            };
            let entry = if ready {
                Ok(endpoint)
            } else {
                Err("node not provisioned in time".to_string())
            };
            outcome.insert(lang.clone(), entry);
        }
        outcome
    }

    /// Give back `langs` and forget their endpoints.
    pub async fn release(&self, langs: &[String]) {
        if let Err(e) = self.provisioner.release(langs).await {
            warn!(error = %e, "Releasing nodes failed");
        }
        let mut topology = self.lock();
        for lang in langs {
            topology.endpoints.remove(lang);
        }
    }

    pub async fn release_all(&self) {
        let langs: Vec<String> = self.lock().endpoints.keys().cloned().collect();
        self.release(&langs).await;
    }
}

/// Split `host:port`.
pub fn split_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_reports_unknown_languages() {
        let infra = Infrastructure::new(
            Box::new(StaticProvisioner::new([("Fra".to_string(), "10.0.0.2:4455".to_string())])),
            Duration::from_secs(1),
        );
        let langs = vec!["Fra".to_string(), "Deu".to_string()];
        let outcome = infra.ensure(&langs).await;
        assert_eq!(outcome["Fra"], Ok("10.0.0.2:4455".to_string()));
        assert!(outcome["Deu"].is_err());
        assert_eq!(infra.endpoint("Fra").as_deref(), Some("10.0.0.2:4455"));

        infra.release_all().await;
        assert_eq!(infra.topology(), Topology::default());
    }

    #[test]
    fn splits_endpoints() {
        assert_eq!(split_endpoint("10.0.0.2:4455"), Some(("10.0.0.2".into(), 4455)));
        assert_eq!(split_endpoint("10.0.0.2"), None);
        assert_eq!(split_endpoint(":4455"), None);
    }
}
