//! babel node agent library
//!
//! The node agent runs next to one language's media compositor. It receives
//! the language's settings from the orchestrator and keeps the compositor
//! converged to them, independently of any push.
//!
//! ## Architecture
//!
//! ```text
//! control server (/control)
//! └── NodeAgent
//!     ├── Reconciler    (desired vs actual compositor state, every tick)
//!     └── MediaPlayer   (clip playback on its own delay scheduler)
//!         └── Compositor (mock until a real control client is plugged in)
//! ```
//!
//! ## Modules
//!
//! - `compositor`: compositor control trait and the in-memory mock
//! - `desired`: desired state derived from the pushed settings tree
//! - `reconciler`: the convergence loop
//! - `media`: playback state machine
//! - `server`: WebSocket control endpoint and health checks

pub mod agent;
pub mod compositor;
pub mod config;
pub mod desired;
pub mod media;
pub mod reconciler;
pub mod server;

pub use agent::NodeAgent;
pub use compositor::{Compositor, MockCompositor};
