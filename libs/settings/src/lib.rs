//! # babel-settings
//!
//! The configuration model the orchestrator holds for every language.
//!
//! A language's [`LanguageSettings`] tree is an ordered list of
//! [`SettingsSubject`]s (connection, source, stream, audio levels,
//! sidechain/limiter/gain chains, transition). Each subject carries an
//! [`ObjectState`] tag:
//!
//! - `unset`: never configured
//! - `modified`: changed since the last successful push to the node
//! - `active`: confirmed applied on the node
//!
//! Only the subject's own operations move the tag. Writing a field with its
//! current value is a no-op, so re-importing an unchanged configuration never
//! triggers a push.
//!
//! The `connection` subject gates everything else: no other subject may be
//! pushed or activated until the node is reachable.

mod error;
mod schema;
mod subject;
mod tree;

pub use error::SettingsError;
pub use schema::SubjectKind;
pub use subject::{ObjectState, SettingsSubject, STATE_FIELD};
pub use tree::{LanguageSettings, PendingPush};
