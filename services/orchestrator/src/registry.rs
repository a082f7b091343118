//! The authoritative aggregate of per-language settings and server state.
//!
//! Every read and write goes through one lock held only for the duration of
//! a field access or a short composite operation. Nothing here awaits, so the
//! lock is never held across a network wait.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use babel_id::{Revision, SessionId};
use babel_settings::{LanguageSettings, PendingPush, SettingsError, SubjectKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::logring::LogRing;

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Sleeping,
    Initializing,
    Running,
    Disposing,
}

impl Lifecycle {
    /// The state a restart resumes in.
    fn settled(self) -> Self {
        match self {
            Lifecycle::Initializing => Lifecycle::Sleeping,
            Lifecycle::Disposing => Lifecycle::Running,
            other => other,
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Sleeping => "sleeping",
            Lifecycle::Initializing => "initializing",
            Lifecycle::Running => "running",
            Lifecycle::Disposing => "disposing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot {action} while {from}")]
pub struct LifecycleError {
    pub from: Lifecycle,
    pub action: &'static str,
}

/// Persisted part of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub languages: BTreeMap<String, LanguageSettings>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub infrastructure_locked: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: RegistryState,
    previous_lifecycle: Option<Lifecycle>,
    active_console: Option<SessionId>,
}

/// What the activation pipeline needs to (re)connect a language's node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub revision: Revision,
    pub active: bool,
}

#[derive(Debug)]
pub struct Registry {
    inner: Mutex<Inner>,
    logs: LogRing,
}

impl Registry {
    pub fn new(logs: LogRing) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            logs,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    pub fn list_languages(&self) -> Vec<String> {
        self.lock().state.languages.keys().cloned().collect()
    }

    pub fn contains(&self, lang: &str) -> bool {
        self.lock().state.languages.contains_key(lang)
    }

    pub fn language(&self, lang: &str) -> Option<LanguageSettings> {
        self.lock().state.languages.get(lang).cloned()
    }

    /// Sparse-merge `overlay` into `lang`, creating a default tree if absent.
    pub fn update_language(&self, lang: &str, overlay: &Value) -> Result<bool, SettingsError> {
        self.update_languages(&[lang.to_string()], overlay)
    }

    /// Merge the same overlay into several languages, all or nothing.
    pub fn update_languages(&self, langs: &[String], overlay: &Value) -> Result<bool, SettingsError> {
        let mut inner = self.lock();
        let mut staged = Vec::with_capacity(langs.len());
        let mut changed = false;
        for lang in langs {
            let mut tree = inner.state.languages.get(lang).cloned().unwrap_or_default();
            changed |= tree.merge_from(overlay)?;
            staged.push((lang.clone(), tree));
        }
        for (lang, tree) in staged {
            inner.state.languages.insert(lang, tree);
        }
        Ok(changed)
    }

    /// Merge a different overlay per language, all or nothing.
    pub fn import(&self, trees: &BTreeMap<String, Value>) -> Result<bool, SettingsError> {
        let mut inner = self.lock();
        let mut staged = Vec::with_capacity(trees.len());
        let mut changed = false;
        for (lang, overlay) in trees {
            let mut tree = inner.state.languages.get(lang).cloned().unwrap_or_default();
            changed |= tree.merge_from(overlay)?;
            staged.push((lang.clone(), tree));
        }
        for (lang, tree) in staged {
            inner.state.languages.insert(lang, tree);
        }
        Ok(changed)
    }

    pub fn delete_language(&self, lang: &str) -> Option<LanguageSettings> {
        let removed = self.lock().state.languages.remove(lang);
        if removed.is_some() {
            info!(lang, "Language removed from registry");
        }
        removed
    }

    /// Point `lang` at a node. When the address changes, every subject goes
    /// back to `modified` so the new node receives the whole tree.
    pub fn set_connection(
        &self,
        lang: &str,
        host: &str,
        port: u16,
    ) -> Result<ConnectionTarget, SettingsError> {
        let mut inner = self.lock();
        let tree = inner.state.languages.entry(lang.to_string()).or_default();

        let conn = tree.connection();
        let moved = conn.get("host")? != &json!(host) || conn.get("port")? != &json!(port);
        if moved {
            tree.deactivate_all();
        }
        tree.set("connection", "host", json!(host))?;
        tree.set("connection", "port", json!(port))?;

        let conn = tree.connection();
        Ok(ConnectionTarget {
            host: host.to_string(),
            port,
            revision: conn.revision(),
            active: conn.is_active(),
        })
    }

    /// Activate the connection subject unless it changed since `revision`.
    pub fn mark_connection_active(&self, lang: &str, revision: Revision) -> bool {
        let mut inner = self.lock();
        let Some(tree) = inner.state.languages.get_mut(lang) else {
            return false;
        };
        let conn = tree.connection();
        if conn.is_active() {
            return conn.revision() == revision;
        }
        tree.activate_connection_at(revision)
    }

    /// Pending push for `lang`, if any subject is modified.
    pub fn pending_push(&self, lang: &str) -> Result<Option<PendingPush>, SettingsError> {
        let inner = self.lock();
        match inner.state.languages.get(lang) {
            Some(tree) => tree.pending_push(),
            None => Ok(None),
        }
    }

    /// Record that `lang` applied the pushed revisions.
    pub fn record_activation(
        &self,
        lang: &str,
        revisions: &[(SubjectKind, Revision)],
    ) -> Result<usize, SettingsError> {
        let mut inner = self.lock();
        let Some(tree) = inner.state.languages.get_mut(lang) else {
            return Ok(0);
        };
        let activated = tree.record_push(revisions)?;
        debug!(lang, activated, "Recorded activation");
        Ok(activated)
    }

    /// Called when the node behind `lang` is torn down.
    pub fn deactivate_all(&self, lang: &str) {
        if let Some(tree) = self.lock().state.languages.get_mut(lang) {
            tree.deactivate_all();
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().state.lifecycle
    }

    fn transition(
        &self,
        allowed: &[Lifecycle],
        to: Lifecycle,
        action: &'static str,
    ) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        let from = inner.state.lifecycle;
        if !allowed.contains(&from) {
            return Err(LifecycleError { from, action });
        }
        inner.previous_lifecycle = Some(from);
        inner.state.lifecycle = to;
        info!(%from, %to, "Lifecycle transition");
        Ok(())
    }

    /// sleeping -> initializing
    pub fn begin_initialize(&self) -> Result<(), LifecycleError> {
        self.transition(&[Lifecycle::Sleeping], Lifecycle::Initializing, "initialize")
    }

    /// running -> disposing
    pub fn begin_dispose(&self) -> Result<(), LifecycleError> {
        self.transition(&[Lifecycle::Running], Lifecycle::Disposing, "dispose")
    }

    /// initializing -> running, disposing -> sleeping
    pub fn finish(&self) -> Result<(), LifecycleError> {
        match self.lifecycle() {
            Lifecycle::Initializing => {
                self.transition(&[Lifecycle::Initializing], Lifecycle::Running, "finish")
            }
            _ => self.transition(&[Lifecycle::Disposing], Lifecycle::Sleeping, "finish"),
        }
    }

    /// Roll back the last transition.
    pub fn revert(&self) -> Lifecycle {
        let mut inner = self.lock();
        if let Some(previous) = inner.previous_lifecycle.take() {
            info!(from = %inner.state.lifecycle, to = %previous, "Lifecycle reverted");
            inner.state.lifecycle = previous;
        }
        inner.state.lifecycle
    }

    /// Guard the transition just begun: it is reverted on drop unless
    /// [`LifecycleGuard::commit`] finishes it.
    pub fn guard_transition(&self) -> LifecycleGuard<'_> {
        LifecycleGuard {
            registry: self,
            committed: false,
        }
    }

    pub fn infrastructure_locked(&self) -> bool {
        self.lock().state.infrastructure_locked
    }

    pub fn set_infrastructure_locked(&self, locked: bool) {
        self.lock().state.infrastructure_locked = locked;
    }

    pub fn active_console(&self) -> Option<SessionId> {
        self.lock().active_console
    }

    pub fn select_active_console(&self, session: Option<SessionId>) {
        self.lock().active_console = session;
    }

    /// JSON view served by `get info` and watched by the diff broadcaster.
    pub fn snapshot(&self) -> Value {
        let inner = self.lock();
        let languages: serde_json::Map<String, Value> = inner
            .state
            .languages
            .iter()
            .map(|(lang, tree)| {
                (
                    lang.clone(),
                    json!({
                        "reachable": tree.is_reachable(),
                        "subjects": tree.states(),
                    }),
                )
            })
            .collect();

        json!({
            "lifecycle": inner.state.lifecycle,
            "infrastructure_locked": inner.state.infrastructure_locked,
            "active_console": inner.active_console,
            "languages": languages,
        })
    }

    pub fn persisted(&self) -> RegistryState {
        self.lock().state.clone()
    }

    /// Replace the state with a loaded snapshot.
    ///
    /// Transient lifecycles settle, and every subject goes back to `modified`
    /// since no node has confirmed anything to this process yet.
    pub fn restore(&self, mut state: RegistryState) {
        state.lifecycle = state.lifecycle.settled();
        for tree in state.languages.values_mut() {
            tree.deactivate_all();
        }
        let mut inner = self.lock();
        inner.state = state;
        inner.previous_lifecycle = None;
    }
}

/// An in-flight lifecycle transition.
///
/// Dropping it without committing, including while unwinding from a panic,
/// rolls the lifecycle back.
#[must_use = "dropping the guard reverts the transition"]
pub struct LifecycleGuard<'a> {
    registry: &'a Registry,
    committed: bool,
}

impl LifecycleGuard<'_> {
    pub fn commit(mut self) -> Result<(), LifecycleError> {
        self.registry.finish()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let back_to = self.registry.revert();
            warn!(lifecycle = %back_to, "Lifecycle transition abandoned");
        }
    }
}
