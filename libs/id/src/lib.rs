//! # babel-id
//!
//! Typed identifiers for the babel control plane.
//!
//! Every identifier that crosses a process boundary (session handles, RPC
//! correlation tokens, scheduler timers) is a prefixed ULID:
//!
//! - `sess_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `corr_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! The prefix keeps a correlation token from ever being accepted where a
//! session id is expected, and ULIDs sort by creation time which keeps log
//! output readable.
//!
//! [`Revision`] is the monotonically increasing counter attached to settings
//! subjects.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

/// Split `{prefix}_{ulid}` and validate the prefix.
///
/// Shared by every type generated with [`define_id!`].
pub fn parse_prefixed(s: &str, expected: &'static str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let Some((prefix, ulid_str)) = s.split_once('_') else {
        return Err(IdError::MissingSeparator);
    };

    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }

    ulid_str
        .parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
