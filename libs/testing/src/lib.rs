//! Test fixtures.
//!
//! [`FakeNode`] serves the node control channel on a loopback port and answers
//! each request according to a per-command [`Behavior`], recording everything
//! it receives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use babel_protocol::{CommandResult, NodeEvent, RpcReply, RpcRequest};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// How the fake answers a command.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Reply `status: true`.
    Succeed,
    /// Reply `status: false` with this message.
    Fail(String),
    /// Reply with exactly this result.
    Reply(CommandResult),
    /// Never reply.
    Silent,
}

#[derive(Default)]
struct Script {
    default: Option<Behavior>,
    per_command: HashMap<String, Behavior>,
    received: Vec<RpcRequest>,
}

struct Shared {
    script: Mutex<Script>,
    events: broadcast::Sender<NodeEvent>,
}

impl Shared {
    fn behavior_for(&self, command: &str) -> Behavior {
        let script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        script
            .per_command
            .get(command)
            .or(script.default.as_ref())
            .cloned()
            .unwrap_or(Behavior::Succeed)
    }

    fn record(&self, request: RpcRequest) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .received
            .push(request);
    }
}

/// A fake node agent listening on `127.0.0.1`.
pub struct FakeNode {
    addr: SocketAddr,
    shared: Arc<Shared>,
    server: JoinHandle<()>,
}

impl FakeNode {
    /// Bind an ephemeral port and start serving `/control`.
    pub async fn start() -> anyhow::Result<Self> {
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            script: Mutex::new(Script::default()),
            events,
        });

        let app = Router::new()
            .route("/control", get(control))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            shared,
            server,
        })
    }

    /// Start a fake whose every command gets `behavior`.
    pub async fn with_default(behavior: Behavior) -> anyhow::Result<Self> {
        let node = Self::start().await?;
        node.set_default(behavior);
        Ok(node)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` as a provisioner would report it.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self) -> String {
        format!("ws://{}/control", self.addr)
    }

    pub fn set_default(&self, behavior: Behavior) {
        self.shared
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .default = Some(behavior);
    }

    /// Script the answer to one command name.
    pub fn on(&self, command: &str, behavior: Behavior) {
        self.shared
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .per_command
            .insert(command.to_string(), behavior);
    }

    /// Every request received so far, oldest first.
    pub fn received(&self) -> Vec<RpcRequest> {
        self.shared
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .received
            .clone()
    }

    /// Names of the commands received so far.
    pub fn received_commands(&self) -> Vec<String> {
        self.received().into_iter().map(|r| r.command).collect()
    }

    /// Push an unsolicited event to every connected client.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.shared.events.send(event);
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn control(ws: WebSocketUpgrade, State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, shared))
}

async fn serve_socket(socket: WebSocket, shared: Arc<Shared>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = shared.events.subscribe();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(request) = serde_json::from_str::<RpcRequest>(text.as_str()) else {
                    debug!(frame = %text.as_str(), "Fake node ignoring malformed frame");
                    continue;
                };

                let behavior = shared.behavior_for(&request.command);
                let id = request.id;
                let command = request.command.clone();
                shared.record(request);

                let response = match behavior {
                    Behavior::Succeed => CommandResult::ok(format!("{command} done")),
                    Behavior::Fail(message) => CommandResult::failure(message),
                    Behavior::Reply(result) => result,
                    Behavior::Silent => continue,
                };
                let Ok(frame) = serde_json::to_string(&RpcReply { id, response }) else {
                    continue;
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                let Ok(event) = event else { continue };
                let Ok(frame) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
