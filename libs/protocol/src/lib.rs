//! # babel-protocol
//!
//! Wire types shared by the orchestrator, the node agents and the CLI.
//!
//! ## Session side
//!
//! A session opens with a [`Hello`] (login and password, or nothing for an
//! anonymous session). Clients then send a [`CommandEnvelope`] and receive a
//! [`CommandResult`], interleaved with server-pushed [`Broadcast`] frames:
//!
//! ```text
//! -> {"command": "set settings", "details": {...}, "lang": "Fra"}
//! <- {"status": true, "message": "...", "serializable_object": {...}}
//! ```
//!
//! When a command fans out to several nodes, `serializable_object` maps each
//! language to its own result and the top-level status is the logical AND of
//! the per-language statuses (see [`CommandResult::aggregate`]).
//!
//! ## Node side
//!
//! The orchestrator talks to every node agent over one persistent channel
//! carrying [`RpcRequest`] frames; the node answers with [`RpcReply`] frames
//! echoing the correlation id, and may push unsolicited [`NodeEvent`]s.

mod envelope;
mod error;
mod rpc;
mod session;

pub mod commands;

pub use envelope::*;
pub use error::ProtocolError;
pub use rpc::*;
pub use session::{Broadcast, Hello, SessionFrame, Welcome};
