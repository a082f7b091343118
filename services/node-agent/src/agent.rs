//! Node command handling.
//!
//! Every request on the control channel lands in [`NodeAgent::handle`] and
//! always produces a [`CommandResult`]; nothing here fails the connection.

use std::sync::Arc;

use babel_protocol::{commands, CommandResult, MediaMode, NodeEvent, RpcRequest};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::compositor::Compositor;
use crate::config::Config;
use crate::desired::{DesiredState, SharedDesired};
use crate::media::{MediaListener, MediaPlayer, RunOutcome};
use crate::reconciler::{Reconciler, ReconcilerConfig};

const EVENT_CAPACITY: usize = 64;

/// Forwards playback notifications to every control connection.
struct EventForwarder {
    lang: String,
    events: broadcast::Sender<NodeEvent>,
}

impl EventForwarder {
    fn emit(&self, event: &str, data: Value) {
        // No receiver just means no orchestrator is connected.
        let _ = self.events.send(NodeEvent {
            event: event.to_string(),
            data,
        });
    }
}

impl MediaListener for EventForwarder {
    fn started(&self, name: &str) {
        self.emit(commands::events::MEDIA_STARTED, json!({ "lang": self.lang, "name": name }));
    }

    fn finished(&self, name: &str, error: Option<&str>) {
        self.emit(
            commands::events::MEDIA_FINISHED,
            json!({ "lang": self.lang, "name": name, "error": error }),
        );
    }
}

pub struct NodeAgent {
    lang: String,
    compositor: Arc<dyn Compositor>,
    reconciler: Arc<Reconciler>,
    player: MediaPlayer,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeAgent {
    pub fn new(config: &Config, compositor: Arc<dyn Compositor>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let reconciler = Arc::new(Reconciler::new(
            compositor.clone(),
            SharedDesired::default(),
            ReconcilerConfig {
                interval: config.reconcile_interval,
            },
        ));
        let listener = Arc::new(EventForwarder {
            lang: config.lang.clone(),
            events: events.clone(),
        });
        let player = MediaPlayer::new(reconciler.clone(), config.media_dir.clone(), listener);

        Self {
            lang: config.lang.clone(),
            compositor,
            reconciler,
            player,
            events,
        }
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn player(&self) -> &MediaPlayer {
        &self.player
    }

    /// Whether the compositor answers right now.
    pub async fn compositor_reachable(&self) -> bool {
        self.compositor.ensure_connected().await.is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Start the reconciliation loop and the media scheduler.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<(&'static str, JoinHandle<()>)> {
        let reconciler = self.reconciler.clone();
        let loop_shutdown = shutdown.clone();
        vec![
            (
                "reconciler",
                tokio::spawn(async move { reconciler.run(loop_shutdown).await }),
            ),
            ("media scheduler", self.player.spawn(shutdown)),
        ]
    }

    pub async fn handle(&self, request: &RpcRequest) -> CommandResult {
        let details = request.details.as_ref().unwrap_or(&Value::Null);
        match request.command.as_str() {
            commands::node::PING => CommandResult::ok("pong"),
            commands::node::SET_CONFIG => self.set_config(details).await,
            commands::node::RUN_MEDIA => self.run_media(details).await,
            commands::node::STOP_MEDIA => self.stop_media().await,
            commands::node::GET_INFO => self.info(),
            other => {
                warn!(command = %other, "Unknown node command");
                CommandResult::failure(format!("unknown command '{other}'"))
            }
        }
    }

    async fn set_config(&self, details: &Value) -> CommandResult {
        let next = match DesiredState::from_push(details) {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "Rejected pushed settings");
                return CommandResult::failure(e.to_string());
            }
        };
        info!(lang = %self.lang, inputs = next.inputs.len(), "Applying pushed settings");
        self.reconciler.desired().replace_settings(next);

        match self.reconciler.reconcile().await {
            Ok(status) => CommandResult::ok(format!("settings applied ({status:?})")),
            Err(e) => {
                warn!(lang = %self.lang, error = %e, "Pushed settings not applied yet");
                CommandResult::failure(e.to_string())
            }
        }
    }

    async fn run_media(&self, details: &Value) -> CommandResult {
        let Some(name) = details.get("name").and_then(Value::as_str) else {
            return CommandResult::failure("missing detail 'name'");
        };
        let mode = match details.get("mode").and_then(Value::as_str) {
            Some(mode) => match mode.parse::<MediaMode>() {
                Ok(mode) => mode,
                Err(e) => return CommandResult::failure(e.to_string()),
            },
            None => MediaMode::default(),
        };

        match self.player.run_media(name, mode).await {
            Ok(RunOutcome::Started) => CommandResult::ok(format!("playing {name}")),
            Ok(RunOutcome::AlreadyPlaying) => CommandResult::ok("already playing"),
            Err(e) => CommandResult::failure(e.to_string()),
        }
    }

    async fn stop_media(&self) -> CommandResult {
        match self.player.stop_media().await {
            Ok(true) => CommandResult::ok("media stopped"),
            Ok(false) => CommandResult::ok("nothing playing"),
            Err(e) => CommandResult::failure(e.to_string()),
        }
    }

    fn info(&self) -> CommandResult {
        CommandResult::ok("node info").with_object(json!({
            "lang": self.lang,
            "version": env!("CARGO_PKG_VERSION"),
            "playback": self.player.state(),
            "desired": self.reconciler.desired().snapshot().summary(),
        }))
    }
}
