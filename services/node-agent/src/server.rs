//! Control server.
//!
//! `/control` is a WebSocket carrying [`RpcRequest`] frames from the
//! orchestrator. Each request is answered with an [`RpcReply`] echoing its
//! id; playback events are pushed on the same socket. `/healthz` and
//! `/readyz` report liveness and compositor reachability.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use babel_protocol::{RpcReply, RpcRequest};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::agent::NodeAgent;

pub fn create_router(agent: Arc<NodeAgent>) -> Router {
    Router::new()
        .route("/control", get(control))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    lang: String,
    version: &'static str,
    timestamp: String,
}

fn health(agent: &NodeAgent, status: &'static str) -> Json<HealthResponse> {
    Json(HealthResponse {
        status,
        service: "node-agent",
        lang: agent.lang().to_string(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn healthz(State(agent): State<Arc<NodeAgent>>) -> impl IntoResponse {
    health(&agent, "ok")
}

/// Ready once the compositor answers.
async fn readyz(State(agent): State<Arc<NodeAgent>>) -> impl IntoResponse {
    if agent.compositor_reachable().await {
        (StatusCode::OK, health(&agent, "ok"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, health(&agent, "degraded"))
    }
}

async fn control(State(agent): State<Arc<NodeAgent>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, agent))
}

async fn serve(socket: WebSocket, agent: Arc<NodeAgent>) {
    info!(lang = %agent.lang(), "Control connection opened");

    let (mut sink, mut source) = socket.split();
    let (outgoing, mut queue) = mpsc::unbounded_channel::<String>();
    let mut events = agent.subscribe();

    let writer = tokio::spawn(async move {
        while let Some(text) = queue.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let pusher = {
        let outgoing = outgoing.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if outgoing.send(text).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Control connection lagged behind events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(msg) = source.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let request: RpcRequest = match serde_json::from_str(text.as_str()) {
            Ok(request) => request,
            Err(e) => {
                // Without an id there is nobody to answer.
                warn!(error = %e, "Ignoring malformed control frame");
                continue;
            }
        };

        debug!(id = %request.id, command = %request.command, "Control request");
        let response = agent.handle(&request).await;
        let reply = RpcReply {
            id: request.id,
            response,
        };
        let Ok(text) = serde_json::to_string(&reply) else { continue };
        if outgoing.send(text).is_err() {
            break;
        }
    }

    pusher.abort();
    drop(outgoing);
    let _ = writer.await;
    info!(lang = %agent.lang(), "Control connection closed");
}
