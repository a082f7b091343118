use thiserror::Error;

/// Errors raised by settings operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// Unknown subject or field name.
    #[error("invalid key '{0}'")]
    InvalidKey(String),

    /// Attempt to write the state tag through `set`.
    #[error("the state tag cannot be set directly")]
    StateTagForbidden,

    /// Value of the wrong type for the field.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// A non-connection subject was pushed or activated before the node was reachable.
    #[error("connection settings are not active yet")]
    ConnectionNotActive,

    /// A serialized tree is structurally wrong.
    #[error("invalid settings tree: {0}")]
    InvalidTree(String),
}
