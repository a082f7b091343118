//! Command failures and their conversion into response envelopes.

use babel_protocol::{CommandEnvelope, CommandResult, ProtocolError};
use babel_settings::SettingsError;
use serde_json::{json, Value};
use thiserror::Error;

use crate::fleet::FleetError;
use crate::registry::{Lifecycle, LifecycleError};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{command}' is not allowed while the server is {lifecycle}")]
    LifecycleDenied {
        command: String,
        lifecycle: Lifecycle,
    },

    #[error("command '{0}' requires admin")]
    AdminRequired(String),

    #[error("LanguageDenied: {0}")]
    LanguageDenied(String),

    #[error("session is not authenticated")]
    Unauthenticated,

    #[error("unknown language '{0}'")]
    UnknownLanguage(String),

    #[error("command '{0}' needs an explicit language")]
    LanguageRequired(String),

    #[error("InvalidKey: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Settings(SettingsError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("infrastructure is locked")]
    InfrastructureLocked,

    #[error("no configuration source is configured")]
    NoConfigSource,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<SettingsError> for CommandError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::InvalidKey(key) => CommandError::InvalidKey(key),
            other => CommandError::Settings(other),
        }
    }
}

impl CommandError {
    /// Failures caused by the caller rather than the server.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CommandError::Internal(_) | CommandError::Fleet(_))
    }

    /// Convert into a failed envelope. Server-side failures carry the
    /// original command for diagnostics.
    pub fn into_result(self, envelope: &CommandEnvelope) -> CommandResult {
        let result = CommandResult::failure(self.to_string());
        if self.is_rejection() {
            result
        } else {
            result.with_object(diagnostics(envelope))
        }
    }
}

pub(crate) fn diagnostics(envelope: &CommandEnvelope) -> Value {
    json!({
        "command": envelope.command,
        "details": envelope.details,
        "lang": envelope.lang,
    })
}
