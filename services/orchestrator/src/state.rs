//! The orchestrator context shared by every subsystem.

use std::sync::{Arc, Weak};

use babel_protocol::{commands, CommandEnvelope, MediaMode, ALL_LANGUAGES};
use futures_util::FutureExt;
use serde_json::json;
use tracing::{info, warn};

use crate::activation::Activator;
use crate::auth::{Caller, Session, UserTable};
use crate::broadcast::Broadcasts;
use crate::config::Config;
use crate::error::CommandError;
use crate::fleet::Fleet;
use crate::hooks::Hooks;
use crate::importer::ConfigSource;
use crate::infrastructure::{Infrastructure, Provisioner};
use crate::logring::LogRing;
use crate::registry::Registry;
use crate::router;
use crate::snapshot::SnapshotStore;
use crate::timing::{TimelineCallback, TimelineEntry, Timing};

/// Shared application state.
///
/// Cloned into every request handler and background loop.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    registry: Arc<Registry>,
    users: Arc<UserTable>,
    fleet: Arc<Fleet>,
    infrastructure: Arc<Infrastructure>,
    activator: Activator,
    importer: Option<Arc<dyn ConfigSource>>,
    timing: Timing,
    hooks: Hooks,
    snapshots: SnapshotStore,
    broadcasts: Broadcasts,
}

impl AppState {
    /// Build the context. Must be called inside a tokio runtime.
    pub fn new(
        config: Config,
        logs: LogRing,
        provisioner: Box<dyn Provisioner>,
        importer: Option<Arc<dyn ConfigSource>>,
    ) -> Self {
        let registry = Arc::new(Registry::new(logs));
        let fleet = Arc::new(Fleet::new(config.rpc_timeout));
        let infrastructure = Arc::new(Infrastructure::new(provisioner, config.provision_timeout));

        let inner = Arc::new_cyclic(|weak: &Weak<AppStateInner>| AppStateInner {
            activator: Activator::new(registry.clone(), infrastructure.clone(), fleet.clone()),
            timing: Timing::new(play_on_timeline(weak.clone())),
            hooks: Hooks::new(config.hook_workers, config.hook_workers * 64),
            snapshots: SnapshotStore::new(config.data_dir.clone()),
            broadcasts: Broadcasts::default(),
            users: Arc::new(UserTable::default()),
            config,
            registry,
            fleet,
            infrastructure,
            importer,
        });
        Self { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn users(&self) -> &Arc<UserTable> {
        &self.inner.users
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.inner.fleet
    }

    pub fn infrastructure(&self) -> &Arc<Infrastructure> {
        &self.inner.infrastructure
    }

    pub fn activator(&self) -> &Activator {
        &self.inner.activator
    }

    pub fn importer(&self) -> Option<&Arc<dyn ConfigSource>> {
        self.inner.importer.as_ref()
    }

    pub fn timing(&self) -> &Timing {
        &self.inner.timing
    }

    pub fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.inner.snapshots
    }

    pub fn broadcasts(&self) -> &Broadcasts {
        &self.inner.broadcasts
    }

    /// Who `session` is right now. Permissions are re-read on every call so
    /// a credential sync takes effect on the next command.
    pub fn resolve_caller(&self, session: &Session) -> Result<Caller, CommandError> {
        match &session.login {
            Some(login) => self
                .inner
                .users
                .permissions(login)
                .map(|permissions| Caller::User {
                    login: login.clone(),
                    permissions,
                })
                .ok_or(CommandError::Unauthenticated),
            None if self.inner.registry.active_console() == Some(session.id) => {
                Ok(Caller::ActiveConsole)
            }
            None => Ok(Caller::Anonymous),
        }
    }

    /// Resume from whatever snapshot blobs exist and reconnect the listed
    /// nodes. Returns how many nodes came back.
    pub async fn restore_snapshot(&self) -> usize {
        let loaded = self.inner.snapshots.load().await;

        if let Some(registry) = loaded.registry {
            info!(languages = registry.languages.len(), "Restoring registry");
            self.inner.registry.restore(registry);
        }
        if let Some(topology) = loaded.topology {
            info!(nodes = topology.endpoints.len(), "Restoring topology");
            self.inner.infrastructure.restore(topology);
        }

        let mut reconnected = 0;
        for node in loaded.nodes.unwrap_or_default() {
            match self.inner.fleet.connect(&node.lang, &node.endpoint).await {
                Ok(_) => reconnected += 1,
                Err(e) => warn!(lang = %node.lang, error = %e, "Could not reconnect restored node"),
            }
        }
        reconnected
    }
}

/// Timeline entries play on every language, forcing over whatever runs.
fn play_on_timeline(state: Weak<AppStateInner>) -> TimelineCallback {
    Arc::new(move |entry: TimelineEntry| {
        let state = state.clone();
        async move {
            let Some(inner) = state.upgrade() else {
                return false;
            };
            let state = AppState { inner };
            let envelope = CommandEnvelope::new(commands::PLAY_MEDIA)
                .with_lang(ALL_LANGUAGES)
                .with_details(json!({ "name": entry.name, "mode": MediaMode::Force }));
            router::dispatch(&state, &Caller::Internal, envelope).await.status
        }
        .boxed()
    })
}
