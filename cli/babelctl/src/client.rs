//! Orchestrator session client.
//!
//! Opens `/session`, performs the hello handshake and then exchanges command
//! envelopes. Broadcasts that arrive while waiting for a reply are queued and
//! handed out by [`SessionClient::next_broadcast`].

use std::collections::VecDeque;

use babel_protocol::{Broadcast, CommandEnvelope, CommandResult, Hello, SessionFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::CliError;

pub struct SessionClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Broadcast>,
    welcome: CommandResult,
}

impl SessionClient {
    /// Connect and authenticate; a refused hello is an error.
    pub async fn connect(url: &str, hello: &Hello) -> Result<Self, CliError> {
        let (stream, _) = connect_async(url).await.map_err(|e| CliError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let mut client = Self {
            stream,
            pending: VecDeque::new(),
            welcome: CommandResult::ok(""),
        };
        client.send_json(hello).await?;

        let welcome = client.next_result().await?;
        if !welcome.status {
            return Err(CliError::Refused(welcome.message));
        }
        client.welcome = welcome;
        Ok(client)
    }

    /// The handshake reply, carrying the session id.
    pub fn welcome(&self) -> &CommandResult {
        &self.welcome
    }

    pub async fn execute(&mut self, envelope: &CommandEnvelope) -> Result<CommandResult, CliError> {
        self.send_json(envelope).await?;
        self.next_result().await
    }

    /// Next broadcast, queued ones first. `None` once the socket closes.
    pub async fn next_broadcast(&mut self) -> Result<Option<Broadcast>, CliError> {
        if let Some(broadcast) = self.pending.pop_front() {
            return Ok(Some(broadcast));
        }
        loop {
            match self.next_frame().await? {
                Some(SessionFrame::Broadcast(broadcast)) => return Ok(Some(broadcast)),
                Some(SessionFrame::Result(_)) => continue,
                None => return Ok(None),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }

    async fn send_json<T: serde::Serialize>(&mut self, value: &T) -> Result<(), CliError> {
        let text = serde_json::to_string(value).map_err(anyhow::Error::from)?;
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    async fn next_result(&mut self) -> Result<CommandResult, CliError> {
        loop {
            match self.next_frame().await? {
                Some(SessionFrame::Result(result)) => return Ok(result),
                Some(SessionFrame::Broadcast(broadcast)) => self.pending.push_back(broadcast),
                None => return Err(CliError::Closed),
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Option<SessionFrame>, CliError> {
        while let Some(msg) = self.stream.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(_) => return Ok(None),
                _ => continue,
            };
            // Frames this client does not understand are not fatal.
            if let Ok(frame) = SessionFrame::parse(text.as_str()) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}
