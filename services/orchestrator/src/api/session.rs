//! WebSocket sessions.
//!
//! The first text frame is a [`Hello`]; the reply carries the session id.
//! After that every text frame is a command envelope answered in order, and
//! broadcasts are interleaved on the same socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use babel_protocol::{CommandResult, Hello, Welcome};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::auth::Session;
use crate::router;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/session", get(connect))
}

async fn connect(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, state))
}

fn frame<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "Failed to serialize session frame");
            None
        }
    }
}

async fn next_text(socket: &mut WebSocket) -> Option<String> {
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Validate the hello frame.
fn open_session(state: &AppState, text: &str) -> Result<Session, CommandResult> {
    let hello = Hello::parse(text).map_err(|e| CommandResult::failure(e.to_string()))?;
    if hello.is_anonymous() {
        return Ok(Session::anonymous());
    }

    let login = hello.login.unwrap_or_default();
    let password = hello.password.unwrap_or_default();
    match state.users().authenticate(&login, &password) {
        Some(_) => Ok(Session::user(login)),
        None => {
            warn!(login = %login, "Authentication failed");
            Err(CommandResult::failure("authentication failed"))
        }
    }
}

async fn serve(mut socket: WebSocket, state: AppState) {
    let Some(hello) = next_text(&mut socket).await else {
        return;
    };

    let session = match open_session(&state, &hello) {
        Ok(session) => session,
        Err(rejection) => {
            if let Some(text) = frame(&rejection) {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            let _ = socket.close().await;
            return;
        }
    };

    // Subscribe before the welcome so nothing published after it is missed.
    let mut broadcasts = state.broadcasts().subscribe();

    let welcome = CommandResult::ok("welcome").with_object(
        serde_json::to_value(Welcome {
            session_id: session.id,
            login: session.login.clone(),
        })
        .unwrap_or_default(),
    );
    let Some(welcome) = frame(&welcome) else {
        return;
    };
    if socket.send(Message::Text(welcome.into())).await.is_err() {
        return;
    }
    info!(session_id = %session.id, login = session.login.as_deref().unwrap_or(""), "Session opened");

    let (mut sink, mut source) = socket.split();
    let (outgoing, mut queue) = mpsc::unbounded_channel::<String>();

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
        let session_id = session.id;
        tokio::spawn(async move {
            loop {
                match broadcasts.recv().await {
                    Ok(message) => {
                        let Some(text) = frame(&message) else { continue };
                        if outgoing.send(text).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%session_id, skipped, "Session lagged behind broadcasts");
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
        let result = router::handle_frame(&state, &session, text.as_str()).await;
        let Some(reply) = frame(&result) else { continue };
        if outgoing.send(reply).is_err() {
            break;
        }
    }

    pusher.abort();
    drop(outgoing);
    let _ = writer.await;

    if state.registry().active_console() == Some(session.id) {
        state.registry().select_active_console(None);
    }
    info!(session_id = %session.id, "Session closed");
}
