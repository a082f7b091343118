//! Configuration import/export collaborator.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

/// Where `pull config` reads trees from and `push config` writes them to.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// `{lang: {subject: {field: value}}}`; absent fields mean "leave unchanged".
    async fn pull(&self) -> anyhow::Result<BTreeMap<String, Value>>;

    /// Write back the given languages; others in the source stay as they are.
    async fn push(&self, trees: BTreeMap<String, Value>) -> anyhow::Result<()>;
}

/// A JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for JsonFileSource {
    async fn pull(&self) -> anyhow::Result<BTreeMap<String, Value>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn push(&self, trees: BTreeMap<String, Value>) -> anyhow::Result<()> {
        let mut current = match tokio::fs::try_exists(&self.path).await {
            Ok(true) => self.pull().await?,
            _ => BTreeMap::new(),
        };
        current.extend(trees);
        let raw = serde_json::to_string_pretty(&current)?;
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn push_keeps_other_languages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"Deu": {"stream": {"key": "d"}}}"#)
            .await
            .unwrap();

        let source = JsonFileSource::new(&path);
        source
            .push(BTreeMap::from([("Fra".to_string(), json!({"stream": {"key": "f"}}))]))
            .await
            .unwrap();

        let pulled = source.pull().await.unwrap();
        assert_eq!(pulled["Deu"]["stream"]["key"], "d");
        assert_eq!(pulled["Fra"]["stream"]["key"], "f");
    }
}
