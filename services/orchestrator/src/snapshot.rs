//! Snapshot persistence: three independent JSON blobs in the data dir.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::fleet::NodeRecord;
use crate::infrastructure::Topology;
use crate::registry::RegistryState;

const REGISTRY_FILE: &str = "registry.json";
const INFRASTRUCTURE_FILE: &str = "infrastructure.json";
const NODES_FILE: &str = "nodes.json";

/// Whatever could be read back; a missing or corrupt blob is `None`.
#[derive(Debug, Default)]
pub struct LoadedSnapshot {
    pub registry: Option<RegistryState>,
    pub topology: Option<Topology>,
    pub nodes: Option<Vec<NodeRecord>>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(
        &self,
        registry: &RegistryState,
        topology: &Topology,
        nodes: &[NodeRecord],
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        self.write(REGISTRY_FILE, registry).await?;
        self.write(INFRASTRUCTURE_FILE, topology).await?;
        self.write(NODES_FILE, &nodes).await?;

        info!(dir = %self.dir.display(), "Snapshot saved");
        Ok(())
    }

    async fn write<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let raw = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {}", path.display()))
    }

    pub async fn load(&self) -> LoadedSnapshot {
        LoadedSnapshot {
            registry: self.read(REGISTRY_FILE).await,
            topology: self.read(INFRASTRUCTURE_FILE).await,
            nodes: self.read(NODES_FILE).await,
        }
    }

    async fn read<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.dir.join(name);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read snapshot blob");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt snapshot blob");
                None
            }
        }
    }
}
