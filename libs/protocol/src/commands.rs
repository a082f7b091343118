//! Command names.
//!
//! Session commands are the strings a client puts in `command`; node commands
//! travel on the orchestrator-to-node control channel.

// =============================================================================
// Session commands
// =============================================================================

pub const GET_INFO: &str = "get info";
pub const GET_LOGS: &str = "get logs";
pub const PULL_CONFIG: &str = "pull config";
pub const PUSH_CONFIG: &str = "push config";
pub const SET_SETTINGS: &str = "set settings";
pub const REMOVE_LANGUAGE: &str = "remove language";
pub const INITIALIZE: &str = "initialize";
pub const DISPOSE: &str = "dispose";
pub const INFRASTRUCTURE_LOCK: &str = "infrastructure lock";
pub const INFRASTRUCTURE_UNLOCK: &str = "infrastructure unlock";
pub const SELECT_ACTIVE_CONSOLE: &str = "select active console";
pub const PLAY_MEDIA: &str = "play media";
pub const STOP_MEDIA: &str = "stop media";
pub const NODE_INFO: &str = "node info";
pub const TIMING_SET: &str = "timing set";
pub const TIMING_START: &str = "timing start";
pub const TIMING_STOP: &str = "timing stop";
pub const TIMING_GET: &str = "timing get";
pub const SAVE_SNAPSHOT: &str = "save snapshot";

/// Every session command, in documentation order.
pub const ALL: &[&str] = &[
    GET_INFO,
    GET_LOGS,
    PULL_CONFIG,
    PUSH_CONFIG,
    SET_SETTINGS,
    REMOVE_LANGUAGE,
    INITIALIZE,
    DISPOSE,
    INFRASTRUCTURE_LOCK,
    INFRASTRUCTURE_UNLOCK,
    SELECT_ACTIVE_CONSOLE,
    PLAY_MEDIA,
    STOP_MEDIA,
    NODE_INFO,
    TIMING_SET,
    TIMING_START,
    TIMING_STOP,
    TIMING_GET,
    SAVE_SNAPSHOT,
];

// =============================================================================
// Node commands
// =============================================================================

pub mod node {
    pub const PING: &str = "ping";
    pub const SET_CONFIG: &str = "set config";
    pub const RUN_MEDIA: &str = "run media";
    pub const STOP_MEDIA: &str = "stop media";
    pub const GET_INFO: &str = "get info";
}

// =============================================================================
// Node events
// =============================================================================

pub mod events {
    pub const MEDIA_STARTED: &str = "media started";
    pub const MEDIA_FINISHED: &str = "media finished";
}
