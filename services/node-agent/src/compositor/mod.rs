//! Compositor control interface.
//!
//! The agent drives the local media compositor (scenes, inputs, filters,
//! stream output) through this trait. A mock implementation is provided for
//! testing and for running the agent without a compositor attached.

mod mock;

pub use mock::MockCompositor;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompositorError {
    #[error("compositor unreachable: {0}")]
    Disconnected(String),

    #[error("no such {kind} '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("compositor rejected request: {0}")]
    Rejected(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, CompositorError>;

/// Where an input's audio goes besides the mix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorType {
    #[default]
    None,
    MonitorOnly,
    MonitorAndOutput,
}

impl std::str::FromStr for MonitorType {
    type Err = CompositorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(MonitorType::None),
            "monitor_only" => Ok(MonitorType::MonitorOnly),
            "monitor_and_output" => Ok(MonitorType::MonitorAndOutput),
            other => Err(CompositorError::Rejected(format!("unknown monitor type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub kind: String,
    pub settings: Value,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputState {
    pub kind: String,
    pub settings: Value,
    #[serde(default)]
    pub muted: bool,
    /// dB
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub monitor: MonitorType,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterState>,
}

impl InputState {
    pub fn new(kind: impl Into<String>, settings: Value) -> Self {
        Self {
            kind: kind.into(),
            settings,
            muted: false,
            volume: 0.0,
            monitor: MonitorType::None,
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTarget {
    pub server: String,
    pub key: String,
}

#[async_trait]
pub trait Compositor: Send + Sync {
    /// Verify the control connection, reconnecting if it dropped.
    async fn ensure_connected(&self) -> Result<()>;

    async fn scenes(&self) -> Result<Vec<String>>;
    async fn current_scene(&self) -> Result<Option<String>>;
    async fn create_scene(&self, name: &str) -> Result<()>;
    async fn set_current_scene(&self, name: &str) -> Result<()>;

    /// Every input with its filters.
    async fn inputs(&self) -> Result<BTreeMap<String, InputState>>;
    async fn create_input(&self, scene: &str, name: &str, kind: &str, settings: &Value) -> Result<()>;
    async fn remove_input(&self, name: &str) -> Result<()>;
    async fn set_input_settings(&self, name: &str, settings: &Value) -> Result<()>;
    async fn set_input_volume(&self, name: &str, volume: f64) -> Result<()>;
    async fn set_input_mute(&self, name: &str, muted: bool) -> Result<()>;
    async fn set_monitor_type(&self, name: &str, monitor: MonitorType) -> Result<()>;

    async fn add_filter(&self, input: &str, name: &str, filter: &FilterState) -> Result<()>;
    async fn remove_filter(&self, input: &str, name: &str) -> Result<()>;
    async fn set_filter_settings(&self, input: &str, name: &str, settings: &Value) -> Result<()>;
    async fn set_filter_enabled(&self, input: &str, name: &str, enabled: bool) -> Result<()>;

    async fn stream_target(&self) -> Result<Option<StreamTarget>>;
    async fn set_stream_target(&self, target: &StreamTarget) -> Result<()>;

    /// Total length of the media loaded in `input`, once known.
    async fn media_duration(&self, input: &str) -> Result<Option<Duration>>;
    async fn seek_media(&self, input: &str, offset: Duration) -> Result<()>;
}
