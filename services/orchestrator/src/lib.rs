//! babel orchestrator
//!
//! Holds the desired settings of every language, authorizes and routes
//! session commands, and pushes configuration to the per-language nodes.

pub mod activation;
pub mod api;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod fleet;
pub mod hooks;
pub mod importer;
pub mod infrastructure;
pub mod logring;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod snapshot;
pub mod state;
pub mod timing;
