//! Error types for envelope parsing.

use thiserror::Error;

/// Errors raised while decoding protocol frames.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The frame is not valid JSON or not a JSON object.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The object has no `command` string.
    #[error("message has no command")]
    MissingCommand,

    /// `details` is present but is not an object.
    #[error("details must be an object")]
    InvalidDetails,

    /// A required detail field is absent.
    #[error("missing required detail '{0}'")]
    MissingDetail(String),

    /// A detail field has the wrong shape.
    #[error("invalid detail '{field}': {reason}")]
    InvalidDetail { field: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}
