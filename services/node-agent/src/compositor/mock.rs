//! In-memory compositor.
//!
//! Holds scenes and inputs in memory and records every mutating call as a
//! short string (`"remove_input B"`, `"set_input_volume A -6"`), which tests
//! assert against.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::{Compositor, CompositorError, FilterState, InputState, MonitorType, Result, StreamTarget};

/// Length reported for media without a scripted duration.
const DEFAULT_MEDIA_DURATION: Duration = Duration::from_secs(30);

#[derive(Default)]
struct MockState {
    reachable: bool,
    connected: bool,
    scenes: Vec<String>,
    current_scene: Option<String>,
    inputs: BTreeMap<String, InputState>,
    stream: Option<StreamTarget>,
    calls: Vec<String>,
    failures: HashMap<String, CompositorError>,
    durations: HashMap<String, Duration>,
    seeks: Vec<(String, Duration)>,
}

/// Mock compositor for tests and for running an agent without a compositor.
pub struct MockCompositor {
    state: Mutex<MockState>,
}

impl Default for MockCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCompositor {
    /// A reachable compositor with no scenes and no inputs.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    /// A compositor as a fresh install presents it: the default audio inputs
    /// and one scene.
    pub fn with_defaults() -> Self {
        let mock = Self::new();
        mock.add_scene("Scene", true);
        for name in ["Desktop Audio", "Mic/Aux"] {
            mock.seed_input(name, InputState::new("audio_capture", Value::Object(Default::default())));
        }
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a scene without recording a call.
    pub fn add_scene(&self, name: &str, current: bool) {
        let mut state = self.lock();
        state.scenes.push(name.to_string());
        if current {
            state.current_scene = Some(name.to_string());
        }
    }

    /// Put an input in place without recording a call.
    pub fn seed_input(&self, name: &str, input: InputState) {
        self.lock().inputs.insert(name.to_string(), input);
    }

    pub fn input(&self, name: &str) -> Option<InputState> {
        self.lock().inputs.get(name).cloned()
    }

    pub fn input_names(&self) -> Vec<String> {
        self.lock().inputs.keys().cloned().collect()
    }

    pub fn current_scene_name(&self) -> Option<String> {
        self.lock().current_scene.clone()
    }

    pub fn current_stream(&self) -> Option<StreamTarget> {
        self.lock().stream.clone()
    }

    /// Every mutating call so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Every `seek_media` so far.
    pub fn seeks(&self) -> Vec<(String, Duration)> {
        self.lock().seeks.clone()
    }

    /// Make `operation` (e.g. `"create_input"`) fail until cleared.
    pub fn fail(&self, operation: &str, error: CompositorError) {
        self.lock().failures.insert(operation.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Whether a reconnect attempt can succeed.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.reachable = reachable;
        if !reachable {
            state.connected = false;
        }
    }

    /// Simulate a compositor restart: the connection drops and every input
    /// except the defaults is gone.
    pub fn restart(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.inputs.retain(|_, input| input.kind == "audio_capture");
        state.stream = None;
    }

    /// Length reported for media whose file name is `file`.
    pub fn set_media_duration(&self, file: &str, duration: Duration) {
        self.lock().durations.insert(file.to_string(), duration);
    }

    fn mutate(&self, operation: &str, call: String) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        if !state.connected {
            return Err(CompositorError::Disconnected("not connected".into()));
        }
        if let Some(error) = state.failures.get(operation) {
            return Err(error.clone());
        }
        debug!(call = %call, "[MOCK] Compositor call");
        state.calls.push(call);
        Ok(state)
    }

    fn read(&self) -> Result<MutexGuard<'_, MockState>> {
        let state = self.lock();
        if !state.connected {
            return Err(CompositorError::Disconnected("not connected".into()));
        }
        Ok(state)
    }
}

fn input_mut<'a>(state: &'a mut MockState, name: &str) -> Result<&'a mut InputState> {
    state.inputs.get_mut(name).ok_or_else(|| CompositorError::NotFound {
        kind: "input",
        name: name.to_string(),
    })
}

fn filter_mut<'a>(state: &'a mut MockState, input: &str, name: &str) -> Result<&'a mut FilterState> {
    input_mut(state, input)?
        .filters
        .get_mut(name)
        .ok_or_else(|| CompositorError::NotFound {
            kind: "filter",
            name: format!("{input}/{name}"),
        })
}

#[async_trait]
impl Compositor for MockCompositor {
    async fn ensure_connected(&self) -> Result<()> {
        let mut state = self.lock();
        if state.connected {
            return Ok(());
        }
        if !state.reachable {
            return Err(CompositorError::Disconnected("connection refused".into()));
        }
        info!("[MOCK] Compositor connected");
        state.connected = true;
        Ok(())
    }

    async fn scenes(&self) -> Result<Vec<String>> {
        Ok(self.read()?.scenes.clone())
    }

    async fn current_scene(&self) -> Result<Option<String>> {
        Ok(self.read()?.current_scene.clone())
    }

    async fn create_scene(&self, name: &str) -> Result<()> {
        let mut state = self.mutate("create_scene", format!("create_scene {name}"))?;
        if state.scenes.iter().any(|s| s == name) {
            return Err(CompositorError::Rejected(format!("scene '{name}' exists")));
        }
        state.scenes.push(name.to_string());
        Ok(())
    }

    async fn set_current_scene(&self, name: &str) -> Result<()> {
        let mut state = self.mutate("set_current_scene", format!("set_current_scene {name}"))?;
        if !state.scenes.iter().any(|s| s == name) {
            return Err(CompositorError::NotFound {
                kind: "scene",
                name: name.to_string(),
            });
        }
        state.current_scene = Some(name.to_string());
        Ok(())
    }

    async fn inputs(&self) -> Result<BTreeMap<String, InputState>> {
        Ok(self.read()?.inputs.clone())
    }

    async fn create_input(&self, scene: &str, name: &str, kind: &str, settings: &Value) -> Result<()> {
        let mut state = self.mutate("create_input", format!("create_input {scene}/{name}"))?;
        if !state.scenes.iter().any(|s| s == scene) {
            return Err(CompositorError::NotFound {
                kind: "scene",
                name: scene.to_string(),
            });
        }
        if state.inputs.contains_key(name) {
            return Err(CompositorError::Rejected(format!("input '{name}' exists")));
        }
        state
            .inputs
            .insert(name.to_string(), InputState::new(kind, settings.clone()));
        Ok(())
    }

    async fn remove_input(&self, name: &str) -> Result<()> {
        let mut state = self.mutate("remove_input", format!("remove_input {name}"))?;
        state.inputs.remove(name).map(|_| ()).ok_or_else(|| CompositorError::NotFound {
            kind: "input",
            name: name.to_string(),
        })
    }

    async fn set_input_settings(&self, name: &str, settings: &Value) -> Result<()> {
        let mut state = self.mutate("set_input_settings", format!("set_input_settings {name}"))?;
        let input = input_mut(&mut state, name)?;
        // Overlay, as a real compositor keeps keys it was not sent.
        match (&mut input.settings, settings) {
            (Value::Object(have), Value::Object(want)) => {
                for (k, v) in want {
                    have.insert(k.clone(), v.clone());
                }
            }
            (have, want) => *have = want.clone(),
        }
        Ok(())
    }

    async fn set_input_volume(&self, name: &str, volume: f64) -> Result<()> {
        let mut state = self.mutate("set_input_volume", format!("set_input_volume {name} {volume}"))?;
        input_mut(&mut state, name)?.volume = volume;
        Ok(())
    }

    async fn set_input_mute(&self, name: &str, muted: bool) -> Result<()> {
        let mut state = self.mutate("set_input_mute", format!("set_input_mute {name} {muted}"))?;
        input_mut(&mut state, name)?.muted = muted;
        Ok(())
    }

    async fn set_monitor_type(&self, name: &str, monitor: MonitorType) -> Result<()> {
        let mut state = self.mutate("set_monitor_type", format!("set_monitor_type {name} {monitor:?}"))?;
        input_mut(&mut state, name)?.monitor = monitor;
        Ok(())
    }

    async fn add_filter(&self, input: &str, name: &str, filter: &FilterState) -> Result<()> {
        let mut state = self.mutate("add_filter", format!("add_filter {input}/{name}"))?;
        input_mut(&mut state, input)?
            .filters
            .insert(name.to_string(), filter.clone());
        Ok(())
    }

    async fn remove_filter(&self, input: &str, name: &str) -> Result<()> {
        let mut state = self.mutate("remove_filter", format!("remove_filter {input}/{name}"))?;
        input_mut(&mut state, input)?
            .filters
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CompositorError::NotFound {
                kind: "filter",
                name: format!("{input}/{name}"),
            })
    }

    async fn set_filter_settings(&self, input: &str, name: &str, settings: &Value) -> Result<()> {
        let mut state = self.mutate("set_filter_settings", format!("set_filter_settings {input}/{name}"))?;
        filter_mut(&mut state, input, name)?.settings = settings.clone();
        Ok(())
    }

    async fn set_filter_enabled(&self, input: &str, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.mutate(
            "set_filter_enabled",
            format!("set_filter_enabled {input}/{name} {enabled}"),
        )?;
        filter_mut(&mut state, input, name)?.enabled = enabled;
        Ok(())
    }

    async fn stream_target(&self) -> Result<Option<StreamTarget>> {
        Ok(self.read()?.stream.clone())
    }

    async fn set_stream_target(&self, target: &StreamTarget) -> Result<()> {
        let mut state = self.mutate("set_stream_target", format!("set_stream_target {}", target.server))?;
        state.stream = Some(target.clone());
        Ok(())
    }

    async fn media_duration(&self, input: &str) -> Result<Option<Duration>> {
        let state = self.read()?;
        let Some(found) = state.inputs.get(input) else {
            return Ok(None);
        };
        let file = found
            .settings
            .get("local_file")
            .and_then(Value::as_str)
            .and_then(|path| Path::new(path).file_name())
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        Ok(Some(
            state.durations.get(file).copied().unwrap_or(DEFAULT_MEDIA_DURATION),
        ))
    }

    async fn seek_media(&self, input: &str, offset: Duration) -> Result<()> {
        let mut state = self.mutate("seek_media", format!("seek_media {input}"))?;
        input_mut(&mut state, input)?;
        state.seeks.push((input.to_string(), offset));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn calls_fail_until_connected() {
        let mock = MockCompositor::new();
        assert!(matches!(
            mock.create_scene("main").await,
            Err(CompositorError::Disconnected(_))
        ));

        mock.ensure_connected().await.unwrap();
        mock.create_scene("main").await.unwrap();
        assert_eq!(mock.calls(), vec!["create_scene main"]);
    }

    #[tokio::test]
    async fn unreachable_compositor_refuses_reconnect() {
        let mock = MockCompositor::new();
        mock.set_reachable(false);
        assert!(mock.ensure_connected().await.is_err());

        mock.set_reachable(true);
        assert!(mock.ensure_connected().await.is_ok());
    }

    #[tokio::test]
    async fn restart_keeps_default_inputs_only() {
        let mock = MockCompositor::with_defaults();
        mock.ensure_connected().await.unwrap();
        mock.create_input("Scene", "original", "ffmpeg_source", &json!({}))
            .await
            .unwrap();

        mock.restart();
        assert!(mock.inputs().await.is_err());
        mock.ensure_connected().await.unwrap();
        assert_eq!(mock.input_names(), vec!["Desktop Audio", "Mic/Aux"]);
    }

    #[tokio::test]
    async fn scripted_failures_and_durations() {
        let mock = MockCompositor::with_defaults();
        mock.ensure_connected().await.unwrap();
        mock.fail("create_input", CompositorError::Rejected("no".into()));
        assert!(mock
            .create_input("Scene", "media", "ffmpeg_source", &json!({}))
            .await
            .is_err());

        mock.clear_failures();
        mock.set_media_duration("intro.mp4", Duration::from_secs(7));
        mock.create_input("Scene", "media", "ffmpeg_source", &json!({"local_file": "/media/intro.mp4"}))
            .await
            .unwrap();
        assert_eq!(
            mock.media_duration("media").await.unwrap(),
            Some(Duration::from_secs(7))
        );
    }
}
