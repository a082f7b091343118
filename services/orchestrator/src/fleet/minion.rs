//! Proxy for one node's persistent control channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use babel_id::CorrelationId;
use babel_protocol::{commands, CommandResult, NodeFrame, RpcRequest};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::rpc::{PendingReplies, ResponseHandle};
use super::{FleetError, FleetEvent};

/// One language's node, reached over a WebSocket control channel.
///
/// Owns the channel exclusively: a reader task resolves pending handles by
/// correlation id and forwards unsolicited events, a writer task drains the
/// outgoing queue.
pub struct MinionProxy {
    lang: String,
    endpoint: String,
    outgoing: mpsc::UnboundedSender<String>,
    pending: Arc<PendingReplies>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for MinionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinionProxy")
            .field("lang", &self.lang)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MinionProxy {
    /// Dial `ws://{endpoint}/control`. Failure is returned immediately.
    pub async fn connect(
        lang: &str,
        endpoint: &str,
        events: broadcast::Sender<FleetEvent>,
        connect_timeout: Duration,
    ) -> Result<Self, FleetError> {
        let url = format!("ws://{endpoint}/control");
        let connect_err = |reason: String| FleetError::Connect {
            lang: lang.to_string(),
            endpoint: endpoint.to_string(),
            reason,
        };

        let (stream, _) = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(&url))
            .await
            .map_err(|_| connect_err(format!("timed out after {connect_timeout:?}")))?
            .map_err(|e| connect_err(e.to_string()))?;

        info!(lang, endpoint, "Connected to node");

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<String>();
        let pending: Arc<PendingReplies> = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let writer = {
            let connected = connected.clone();
            let lang = lang.to_string();
            tokio::spawn(async move {
                while let Some(frame) = queue.recv().await {
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        warn!(lang = %lang, error = %e, "Failed to write to node");
                        break;
                    }
                }
                connected.store(false, Ordering::SeqCst);
                let _ = sink.close().await;
            })
        };

        let reader = {
            let connected = connected.clone();
            let pending = pending.clone();
            let lang = lang.to_string();
            tokio::spawn(async move {
                while let Some(msg) = source.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(lang = %lang, error = %e, "Node channel error");
                            break;
                        }
                    };
                    match NodeFrame::parse(text.as_str()) {
                        Ok(NodeFrame::Reply(reply)) => {
                            let waiter = pending
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .remove(&reply.id);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(reply.response);
                                }
                                None => debug!(lang = %lang, id = %reply.id, "Reply for unknown request"),
                            }
                        }
                        Ok(NodeFrame::Event(event)) => {
                            let _ = events.send(FleetEvent {
                                lang: lang.clone(),
                                event,
                            });
                        }
                        Err(e) => warn!(lang = %lang, error = %e, "Malformed frame from node"),
                    }
                }
                connected.store(false, Ordering::SeqCst);
                // Dropping the senders resolves every waiter as unanswered.
                pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
                info!(lang = %lang, "Node channel closed");
            })
        };

        Ok(Self {
            lang: lang.to_string(),
            endpoint: endpoint.to_string(),
            outgoing,
            pending,
            connected,
            reader,
            writer,
        })
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send `name` and return a handle to its reply.
    pub fn command(&self, name: &str, details: Option<Value>) -> ResponseHandle {
        let id = CorrelationId::new();
        let request = RpcRequest {
            id,
            command: name.to_string(),
            details,
        };
        let frame = match serde_json::to_string(&request) {
            Ok(frame) => frame,
            Err(e) => return ResponseHandle::resolved(&self.lang, CommandResult::failure(e.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tx);

        if !self.is_connected() || self.outgoing.send(frame).is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
            let err = FleetError::NotConnected(self.lang.clone());
            return ResponseHandle::resolved(&self.lang, CommandResult::failure(err.to_string()));
        }

        debug!(lang = %self.lang, command = name, %id, "Sent node command");
        ResponseHandle::waiting(&self.lang, id, rx, &self.pending)
    }

    /// Push a full settings tree (`{subject: {field: value}}`).
    pub fn apply_config(&self, tree: Value) -> ResponseHandle {
        self.command(commands::node::SET_CONFIG, Some(tree))
    }

    /// Close the channel; pending handles resolve as unanswered.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

impl Drop for MinionProxy {
    fn drop(&mut self) {
        self.close();
    }
}
