//! Orchestrator-to-node control channel frames.

use babel_id::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CommandResult, ProtocolError};

/// Request sent from the orchestrator to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: CorrelationId,
    pub command: String,
    #[serde(default)]
    pub details: Option<Value>,
}

/// Reply to an [`RpcRequest`], carrying the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: CorrelationId,
    pub response: CommandResult,
}

/// Unsolicited notification pushed by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Anything a node may write on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeFrame {
    Reply(RpcReply),
    Event(NodeEvent),
}

impl NodeFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// How `run media` treats a clip that may already be playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    /// Always (re)start playback.
    #[default]
    Force,
    /// Do nothing if any clip is playing.
    CheckAny,
    /// Do nothing if this same clip is playing.
    CheckSame,
}

impl std::str::FromStr for MediaMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "force" => Ok(Self::Force),
            "check_any" => Ok(Self::CheckAny),
            "check_same" => Ok(Self::CheckSame),
            other => Err(ProtocolError::InvalidDetail {
                field: "mode".into(),
                reason: format!("unknown media mode '{other}'"),
            }),
        }
    }
}
