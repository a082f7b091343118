//! Session handshake and server push frames.

use babel_id::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// First frame a session client sends.
///
/// Both fields empty opens an anonymous session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Hello {
    pub fn credentials(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: Some(login.into()),
            password: Some(password.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.login.as_deref().unwrap_or("").is_empty()
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Payload of the handshake reply's `serializable_object`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: SessionId,
    pub login: Option<String>,
}

/// Unsolicited frame pushed to sessions (registry changes, clock, node events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub broadcast: String,
    #[serde(default)]
    pub data: Value,
}

impl Broadcast {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            broadcast: kind.into(),
            data,
        }
    }
}

/// Anything the orchestrator writes on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionFrame {
    Broadcast(Broadcast),
    Result(crate::CommandResult),
}

impl SessionFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandResult;
    use serde_json::json;

    #[test]
    fn empty_hello_is_anonymous() {
        assert!(Hello::parse("{}").unwrap().is_anonymous());
        assert!(Hello::parse(r#"{"login": ""}"#).unwrap().is_anonymous());
        assert!(!Hello::credentials("ops", "pw").is_anonymous());
    }

    #[test]
    fn session_frames_are_distinguished() {
        let b = SessionFrame::parse(r#"{"broadcast": "clock", "data": {"now": 1}}"#).unwrap();
        assert_eq!(
            b,
            SessionFrame::Broadcast(Broadcast::new("clock", json!({"now": 1})))
        );

        let r = SessionFrame::parse(r#"{"status": false, "message": "no"}"#).unwrap();
        assert_eq!(r, SessionFrame::Result(CommandResult::failure("no")));
    }
}
