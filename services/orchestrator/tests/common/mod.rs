#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use babel_orchestrator::auth::{hash_password, Credential, Permissions, Session};
use babel_orchestrator::config::Config;
use babel_orchestrator::importer::{ConfigSource, JsonFileSource};
use babel_orchestrator::infrastructure::StaticProvisioner;
use babel_orchestrator::logring::LogRing;
use babel_orchestrator::registry::{Lifecycle, RegistryState};
use babel_orchestrator::router;
use babel_orchestrator::state::AppState;
use babel_protocol::CommandResult;
use babel_testing::{Behavior, FakeNode};
use serde_json::Value;
use tempfile::TempDir;

pub const ADMIN: &str = "root";
pub const FRA_OPERATOR: &str = "fra-op";
pub const PASSWORD: &str = "pw";

pub struct Harness {
    pub state: AppState,
    pub nodes: BTreeMap<String, FakeNode>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn start(nodes: &[(&str, Behavior)]) -> Self {
        Self::start_with_config(nodes, None).await
    }

    /// Like [`Harness::start`], with `trees` served to `pull config`.
    pub async fn start_with_config(nodes: &[(&str, Behavior)], trees: Option<Value>) -> Self {
        let mut started = BTreeMap::new();
        for (lang, behavior) in nodes {
            started.insert(
                lang.to_string(),
                FakeNode::with_default(behavior.clone()).await.unwrap(),
            );
        }

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            rpc_timeout: Duration::from_millis(400),
            provision_timeout: Duration::from_secs(2),
            hook_workers: 1,
            ..Config::default()
        };
        let provisioner = StaticProvisioner::new(
            started
                .iter()
                .map(|(lang, node)| (lang.clone(), node.endpoint())),
        );
        let importer = match trees {
            Some(trees) => {
                let path = dir.path().join("config.json");
                tokio::fs::write(&path, trees.to_string()).await.unwrap();
                Some(Arc::new(JsonFileSource::new(path)) as Arc<dyn ConfigSource>)
            }
            None => None,
        };
        let state = AppState::new(config, LogRing::new(64), Box::new(provisioner), importer);

        state.users().replace(vec![
            Credential {
                login: ADMIN.into(),
                password_hash: hash_password(PASSWORD),
                permissions: Permissions::Admin,
            },
            Credential {
                login: FRA_OPERATOR.into(),
                password_hash: hash_password(PASSWORD),
                permissions: Permissions::Langs(["Fra".to_string()].into()),
            },
        ]);

        Self {
            state,
            nodes: started,
            dir,
        }
    }

    /// Put the server in `running` with an empty tree for every node.
    pub fn running(&self) {
        let languages = self
            .nodes
            .keys()
            .map(|lang| (lang.clone(), Default::default()))
            .collect();
        self.state.registry().restore(RegistryState {
            languages,
            lifecycle: Lifecycle::Running,
            infrastructure_locked: false,
        });
    }

    pub fn langs(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub async fn send(&self, session: &Session, command: Value) -> CommandResult {
        router::handle_frame(&self.state, session, &command.to_string()).await
    }

    pub fn received(&self, lang: &str, command: &str) -> Vec<Value> {
        self.nodes[lang]
            .received()
            .into_iter()
            .filter(|r| r.command == command)
            .map(|r| r.details.unwrap_or_default())
            .collect()
    }
}
