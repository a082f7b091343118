//! Compositor reconciler.
//!
//! Each pass converges the compositor to the desired state:
//! - Verify the control connection (reconnecting if needed)
//! - Create and switch to the desired scene
//! - Delete unknown inputs, then create or update every desired input with
//!   its filters, volume, mute flag and monitor mode
//! - Recreate a lost media source at its elapsed offset
//! - Point the stream output at the desired target
//!
//! Passes run on a fixed interval and right after every desired-state change.
//! A failed pass is logged and the next tick starts over.

use std::sync::Arc;
use std::time::Duration;

use babel_reconcile::{settings_match, ConvergenceStatus, FailureTracker};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::compositor::{Compositor, CompositorError, InputState};
use crate::desired::{DesiredState, SharedDesired, MEDIA, PROTECTED_INPUTS};

/// Volumes closer than this are equal.
const VOLUME_EPSILON: f64 = 0.01;

const FAILURE_KEY: &str = "compositor";

/// Reconciliation loop configuration.
pub struct ReconcilerConfig {
    /// Interval between passes.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
        }
    }
}

pub struct Reconciler {
    compositor: Arc<dyn Compositor>,
    desired: SharedDesired,
    /// Held for the length of a pass so passes never interleave.
    pass: Mutex<()>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(compositor: Arc<dyn Compositor>, desired: SharedDesired, config: ReconcilerConfig) -> Self {
        Self {
            compositor,
            desired,
            pass: Mutex::new(()),
            config,
        }
    }

    pub fn desired(&self) -> &SharedDesired {
        &self.desired
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        let mut failures = FailureTracker::default();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut failures).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self, failures: &mut FailureTracker) {
        match self.reconcile().await {
            Ok(status) => {
                let streak = failures.clear(FAILURE_KEY);
                if streak > 0 {
                    info!(failed_passes = streak, "Compositor reachable again");
                }
                if !status.is_converged() {
                    debug!(?status, "Reconciliation issued corrections");
                }
            }
            Err(e) => {
                let streak = failures.record_failure(FAILURE_KEY);
                if failures.is_exhausted(FAILURE_KEY) {
                    error!(error = %e, streak, "Reconciliation keeps failing");
                } else {
                    warn!(error = %e, streak, "Reconciliation failed, will retry");
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    pub async fn reconcile(&self) -> Result<ConvergenceStatus, CompositorError> {
        let _pass = self.pass.lock().await;

        self.compositor.ensure_connected().await?;
        let desired = self.desired.snapshot();

        let mut changes = 0;
        changes += self.reconcile_scene(&desired).await?;
        changes += self.reconcile_inputs(&desired).await?;
        self.measure_media(&desired).await?;
        changes += self.reconcile_stream(&desired).await?;

        Ok(if changes == 0 {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        })
    }

    async fn reconcile_scene(&self, desired: &DesiredState) -> Result<usize, CompositorError> {
        let mut changes = 0;
        let scenes = self.compositor.scenes().await?;
        if !scenes.iter().any(|s| *s == desired.scene) {
            info!(scene = %desired.scene, "Creating scene");
            self.compositor.create_scene(&desired.scene).await?;
            changes += 1;
        }
        if self.compositor.current_scene().await?.as_deref() != Some(desired.scene.as_str()) {
            self.compositor.set_current_scene(&desired.scene).await?;
            changes += 1;
        }
        Ok(changes)
    }

    async fn reconcile_inputs(&self, desired: &DesiredState) -> Result<usize, CompositorError> {
        let mut changes = 0;
        let wanted = desired.effective_inputs();
        let mut actual = self.compositor.inputs().await?;

        let extras: Vec<String> = actual
            .keys()
            .filter(|name| !wanted.contains_key(*name) && !PROTECTED_INPUTS.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in extras {
            info!(input = %name, "Removing unknown input");
            self.compositor.remove_input(&name).await?;
            actual.remove(&name);
            changes += 1;
        }

        for (name, want) in &wanted {
            let have = match actual.remove(name) {
                Some(have) if have.kind == want.kind => {
                    if !settings_match(&want.settings, &have.settings) {
                        debug!(input = %name, "Updating input settings");
                        self.compositor.set_input_settings(name, &want.settings).await?;
                        changes += 1;
                    }
                    have
                }
                existing => {
                    if existing.is_some() {
                        info!(input = %name, kind = %want.kind, "Replacing input of another kind");
                        self.compositor.remove_input(name).await?;
                    }
                    info!(input = %name, kind = %want.kind, "Creating input");
                    self.compositor
                        .create_input(&desired.scene, name, &want.kind, &want.settings)
                        .await?;
                    changes += 1;
                    if name == MEDIA {
                        self.resume_media(desired).await?;
                    }
                    InputState::new(want.kind.clone(), want.settings.clone())
                }
            };
            changes += self.reconcile_input(name, want, &have).await?;
        }
        Ok(changes)
    }

    /// Filters, volume, mute and monitor mode of one input.
    async fn reconcile_input(
        &self,
        name: &str,
        want: &InputState,
        have: &InputState,
    ) -> Result<usize, CompositorError> {
        let mut changes = self.reconcile_filters(name, want, have).await?;

        if (want.volume - have.volume).abs() > VOLUME_EPSILON {
            self.compositor.set_input_volume(name, want.volume).await?;
            changes += 1;
        }
        if want.muted != have.muted {
            self.compositor.set_input_mute(name, want.muted).await?;
            changes += 1;
        }
        if want.monitor != have.monitor {
            self.compositor.set_monitor_type(name, want.monitor).await?;
            changes += 1;
        }
        Ok(changes)
    }

    async fn reconcile_filters(
        &self,
        input: &str,
        want: &InputState,
        have: &InputState,
    ) -> Result<usize, CompositorError> {
        let mut changes = 0;

        for name in have.filters.keys().filter(|f| !want.filters.contains_key(*f)) {
            self.compositor.remove_filter(input, name).await?;
            changes += 1;
        }

        for (name, filter) in &want.filters {
            match have.filters.get(name) {
                Some(current) if current.kind == filter.kind => {
                    if !settings_match(&filter.settings, &current.settings) {
                        self.compositor
                            .set_filter_settings(input, name, &filter.settings)
                            .await?;
                        changes += 1;
                    }
                    if filter.enabled != current.enabled {
                        self.compositor
                            .set_filter_enabled(input, name, filter.enabled)
                            .await?;
                        changes += 1;
                    }
                }
                current => {
                    if current.is_some() {
                        self.compositor.remove_filter(input, name).await?;
                    }
                    self.compositor.add_filter(input, name, filter).await?;
                    changes += 1;
                }
            }
        }
        Ok(changes)
    }

    /// The media source was just created: either the clip is starting, or
    /// the compositor lost it and playback resumes where it would be now.
    async fn resume_media(&self, desired: &DesiredState) -> Result<(), CompositorError> {
        let Some(media) = &desired.media else {
            return Ok(());
        };
        if media.created {
            let offset = media.elapsed();
            info!(media = %media.name, offset_secs = offset.as_secs_f64(), "Resuming lost media source");
            self.compositor.seek_media(MEDIA, offset).await?;
        } else {
            let started_at = media.started_at;
            self.desired.update(|d| {
                if let Some(current) = d.media.as_mut().filter(|m| m.started_at == started_at) {
                    current.created = true;
                }
            });
        }
        Ok(())
    }

    /// Record the clip length once the compositor reports it.
    async fn measure_media(&self, desired: &DesiredState) -> Result<(), CompositorError> {
        let Some(media) = desired.media.as_ref().filter(|m| m.duration.is_none()) else {
            return Ok(());
        };
        let Some(duration) = self.compositor.media_duration(MEDIA).await? else {
            return Ok(());
        };
        debug!(media = %media.name, duration_secs = duration.as_secs_f64(), "Measured media");
        let started_at = media.started_at;
        self.desired.update(|d| {
            if let Some(current) = d.media.as_mut().filter(|m| m.started_at == started_at) {
                current.duration = Some(duration);
            }
        });
        Ok(())
    }

    async fn reconcile_stream(&self, desired: &DesiredState) -> Result<usize, CompositorError> {
        let Some(target) = &desired.stream else {
            return Ok(0);
        };
        if self.compositor.stream_target().await?.as_ref() == Some(target) {
            return Ok(0);
        }
        info!(server = %target.server, "Setting stream target");
        self.compositor.set_stream_target(target).await?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::{FilterState, MockCompositor, MonitorType};
    use crate::desired::PlayingMedia;
    use serde_json::json;
    use std::path::Path;

    fn input(volume: f64) -> InputState {
        InputState {
            volume,
            ..InputState::new("ffmpeg_source", json!({"input": "srt://a"}))
        }
    }

    fn setup(desired: DesiredState) -> (Arc<MockCompositor>, Reconciler) {
        let mock = Arc::new(MockCompositor::new());
        mock.add_scene("main", true);
        let reconciler = Reconciler::new(
            mock.clone(),
            SharedDesired::new(desired),
            ReconcilerConfig::default(),
        );
        (mock, reconciler)
    }

    #[tokio::test]
    async fn extra_input_is_deleted_and_matching_input_untouched() {
        let mut desired = DesiredState::default();
        desired.inputs.insert("A".into(), input(-6.0));
        let (mock, reconciler) = setup(desired);
        mock.seed_input("A", input(-6.0));
        mock.seed_input("B", input(0.0));

        let status = reconciler.reconcile().await.unwrap();

        assert_eq!(status, ConvergenceStatus::Converging);
        assert_eq!(mock.calls(), vec!["remove_input B"]);
        assert_eq!(mock.input_names(), vec!["A"]);
    }

    #[tokio::test]
    async fn converged_state_issues_no_calls() {
        let mut desired = DesiredState::default();
        desired.inputs.insert("A".into(), input(-6.0));
        let (mock, reconciler) = setup(desired);

        reconciler.reconcile().await.unwrap();
        mock.clear_calls();

        assert_eq!(reconciler.reconcile().await.unwrap(), ConvergenceStatus::Converged);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn actual_only_settings_keys_are_ignored() {
        let mut desired = DesiredState::default();
        desired.inputs.insert("A".into(), input(0.0));
        let (mock, reconciler) = setup(desired);
        mock.seed_input(
            "A",
            InputState::new("ffmpeg_source", json!({"input": "srt://a", "buffering_mb": 2})),
        );

        assert_eq!(reconciler.reconcile().await.unwrap(), ConvergenceStatus::Converged);
    }

    #[tokio::test]
    async fn protected_inputs_survive() {
        let (mock, reconciler) = setup(DesiredState::default());
        mock.seed_input("Desktop Audio", InputState::new("audio_capture", json!({})));
        mock.seed_input("Mic/Aux", InputState::new("audio_capture", json!({})));

        reconciler.reconcile().await.unwrap();
        assert_eq!(mock.input_names(), vec!["Desktop Audio", "Mic/Aux"]);
    }

    #[tokio::test]
    async fn scene_is_created_and_selected() {
        let mock = Arc::new(MockCompositor::with_defaults());
        let reconciler = Reconciler::new(
            mock.clone(),
            SharedDesired::default(),
            ReconcilerConfig::default(),
        );

        reconciler.reconcile().await.unwrap();
        assert_eq!(mock.calls(), vec!["create_scene main", "set_current_scene main"]);
        assert_eq!(mock.current_scene_name().as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn filters_and_mix_are_synced() {
        let mut want = input(-3.0);
        want.muted = true;
        want.monitor = MonitorType::MonitorOnly;
        want.filters.insert(
            "limiter".into(),
            FilterState {
                kind: "limiter_filter".into(),
                settings: json!({"threshold": -6.0}),
                enabled: true,
            },
        );
        want.filters.insert(
            "gain".into(),
            FilterState {
                kind: "gain_filter".into(),
                settings: json!({"db": 2.0}),
                enabled: true,
            },
        );
        let mut desired = DesiredState::default();
        desired.inputs.insert("A".into(), want);
        let (mock, reconciler) = setup(desired);

        let mut have = input(0.0);
        have.filters.insert(
            "gain".into(),
            FilterState {
                kind: "gain_filter".into(),
                settings: json!({"db": 0.0}),
                enabled: false,
            },
        );
        have.filters.insert(
            "stale".into(),
            FilterState {
                kind: "color_filter".into(),
                settings: json!({}),
                enabled: true,
            },
        );
        mock.seed_input("A", have);

        reconciler.reconcile().await.unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                "remove_filter A/stale",
                "set_filter_settings A/gain",
                "set_filter_enabled A/gain true",
                "add_filter A/limiter",
                "set_input_volume A -3",
                "set_input_mute A true",
                "set_monitor_type A MonitorOnly",
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_compositor_fails_the_pass() {
        let (mock, reconciler) = setup(DesiredState::default());
        mock.set_reachable(false);

        assert!(matches!(
            reconciler.reconcile().await,
            Err(CompositorError::Disconnected(_))
        ));

        mock.set_reachable(true);
        assert!(reconciler.reconcile().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_media_source_is_recreated_at_its_offset() {
        let mut desired = DesiredState::default();
        desired.media = Some(PlayingMedia::new("intro.mp4", Path::new("/media")));
        let (mock, reconciler) = setup(desired);

        reconciler.reconcile().await.unwrap();
        assert!(mock.seeks().is_empty());
        let media = reconciler.desired().snapshot().media.unwrap();
        assert!(media.created);
        assert_eq!(media.duration, Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(12)).await;
        mock.restart();
        reconciler.reconcile().await.unwrap();

        let seeks = mock.seeks();
        assert_eq!(seeks.len(), 1);
        assert_eq!(seeks[0].0, MEDIA);
        assert!(seeks[0].1 >= Duration::from_secs(12));
    }

    #[tokio::test]
    async fn stream_target_follows_desired() {
        let mut desired = DesiredState::default();
        desired.stream = Some(crate::compositor::StreamTarget {
            server: "rtmp://ingest".into(),
            key: "k".into(),
        });
        let (mock, reconciler) = setup(desired);

        reconciler.reconcile().await.unwrap();
        assert_eq!(mock.current_stream().unwrap().server, "rtmp://ingest");
        mock.clear_calls();

        reconciler.reconcile().await.unwrap();
        assert!(mock.calls().is_empty());
    }
}
