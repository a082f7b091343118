//! Media playback.
//!
//! One clip at a time plays on the `media` input:
//!
//! ```text
//! idle -> playing -> transitioning_out -> idle
//! ```
//!
//! Starting a clip cancels the end callback of the previous one, puts the
//! clip into the desired state (muting or ducking the feeds), converges the
//! compositor and schedules the end callback for when the measured duration
//! runs out. Ending removes the source, runs the configured transition and
//! reports back through the [`MediaListener`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use babel_protocol::MediaMode;
use babel_scheduler::{Delay, DelayScheduler, SchedulerConfig};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::compositor::CompositorError;
use crate::desired::{PlayingMedia, SharedDesired, TransitionKind, MEDIA};
use crate::reconciler::Reconciler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "name", rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing(String),
    TransitioningOut(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Started,
    /// The mode asked to leave the current clip alone.
    AlreadyPlaying,
}

/// Receives playback start and end notifications.
pub trait MediaListener: Send + Sync {
    fn started(&self, name: &str);

    /// `error` is set when ending the clip failed.
    fn finished(&self, name: &str, error: Option<&str>);
}

struct PlayerInner {
    reconciler: Arc<Reconciler>,
    scheduler: DelayScheduler,
    media_dir: PathBuf,
    state: Mutex<PlaybackState>,
    listener: Arc<dyn MediaListener>,
}

/// Handle to the media player. Clones share the same playback.
#[derive(Clone)]
pub struct MediaPlayer {
    inner: Arc<PlayerInner>,
}

impl MediaPlayer {
    pub fn new(reconciler: Arc<Reconciler>, media_dir: PathBuf, listener: Arc<dyn MediaListener>) -> Self {
        Self {
            inner: Arc::new(PlayerInner {
                reconciler,
                scheduler: DelayScheduler::new(SchedulerConfig {
                    name: "media".to_string(),
                    ..Default::default()
                }),
                media_dir,
                state: Mutex::new(PlaybackState::Idle),
                listener,
            }),
        }
    }

    /// Start the worker that fires end-of-media callbacks.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.inner.scheduler.spawn(shutdown)
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn desired(&self) -> &SharedDesired {
        self.inner.reconciler.desired()
    }

    pub fn state(&self) -> PlaybackState {
        self.lock().clone()
    }

    /// End callbacks not yet fired.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.scheduler.pending_tagged(MEDIA)
    }

    pub async fn run_media(&self, name: &str, mode: MediaMode) -> Result<RunOutcome, CompositorError> {
        {
            let state = self.lock();
            let skip = match (mode, &*state) {
                (MediaMode::Force, _) | (_, PlaybackState::Idle) => false,
                (MediaMode::CheckAny, _) => true,
                (MediaMode::CheckSame, PlaybackState::Playing(current)) => current == name,
                (MediaMode::CheckSame, PlaybackState::TransitioningOut(_)) => false,
            };
            if skip {
                info!(media = %name, ?mode, current = ?*state, "Leaving current media alone");
                return Ok(RunOutcome::AlreadyPlaying);
            }
        }

        self.inner.scheduler.cancel_all(MEDIA);

        // Take the previous clip off air so the new one starts from the top.
        let replacing = self.desired().update(|d| d.media.take().is_some());
        if replacing {
            if let Err(e) = self.inner.reconciler.reconcile().await {
                *self.lock() = PlaybackState::Idle;
                return Err(e);
            }
        }

        let media = PlayingMedia::new(name, &self.inner.media_dir);
        let started_at = media.started_at;
        info!(media = %name, background = media.is_background(), "Starting media");
        self.desired().update(|d| d.media = Some(media));
        *self.lock() = PlaybackState::Playing(name.to_string());

        if let Err(e) = self.inner.reconciler.reconcile().await {
            warn!(media = %name, error = %e, "Media source could not be created");
            self.reset_if_current(started_at);
            return Err(e);
        }

        self.schedule_end(started_at);
        self.inner.listener.started(name);
        Ok(RunOutcome::Started)
    }

    /// Fire [`finish`](Self::finish) when the clip runs out. The clip length
    /// may only be known after a later reconciliation pass, so the delay is
    /// re-read until then.
    fn schedule_end(&self, started_at: Instant) {
        let desired = self.desired().clone();
        let scheduled_at = Instant::now();
        let delay = Delay::dynamic(move || {
            desired.update(|d| match &d.media {
                Some(m) if m.started_at == started_at => match m.duration {
                    Some(duration) => (started_at + duration).saturating_duration_since(scheduled_at),
                    None => Duration::MAX,
                },
                _ => Duration::ZERO,
            })
        });

        let player = self.clone();
        self.inner
            .scheduler
            .schedule_tagged(MEDIA, delay, move || async move {
                player.finish(started_at).await;
                anyhow::Ok(())
            });
    }

    async fn finish(&self, started_at: Instant) {
        let current = self
            .desired()
            .update(|d| d.media.as_ref().is_some_and(|m| m.started_at == started_at));
        if !current {
            return;
        }

        let name = {
            let mut state = self.lock();
            let PlaybackState::Playing(name) = &*state else {
                return;
            };
            let name = name.clone();
            *state = PlaybackState::TransitioningOut(name.clone());
            name
        };
        info!(media = %name, "Media finished");

        let transition = self.desired().update(|d| {
            d.media = None;
            d.transition.kind
        });
        let result = match self.inner.reconciler.reconcile().await {
            Ok(_) => run_transition(transition),
            Err(e) => Err(e),
        };

        {
            let mut state = self.lock();
            if *state == PlaybackState::TransitioningOut(name.clone()) {
                *state = PlaybackState::Idle;
            }
        }

        match result {
            Ok(()) => self.inner.listener.finished(&name, None),
            Err(e) => {
                warn!(media = %name, error = %e, "Ending media failed");
                self.inner.listener.finished(&name, Some(&e.to_string()));
            }
        }
    }

    /// Cancel the end callback and return to idle. Returns whether a clip was
    /// playing.
    pub async fn stop_media(&self) -> Result<bool, CompositorError> {
        self.inner.scheduler.cancel_all(MEDIA);
        let was_playing = self.desired().update(|d| d.media.take().is_some());
        let previous = std::mem::replace(&mut *self.lock(), PlaybackState::Idle);
        info!(previous = ?previous, "Media stopped");

        if was_playing {
            self.inner.reconciler.reconcile().await?;
        }
        Ok(was_playing)
    }

    fn reset_if_current(&self, started_at: Instant) {
        let cleared = self.desired().update(|d| {
            let current = d.media.as_ref().is_some_and(|m| m.started_at == started_at);
            if current {
                d.media = None;
            }
            current
        });
        if cleared {
            *self.lock() = PlaybackState::Idle;
        }
    }
}

fn run_transition(kind: TransitionKind) -> Result<(), CompositorError> {
    match kind {
        TransitionKind::Cut => Ok(()),
        TransitionKind::Stinger => Err(CompositorError::Unsupported("stinger transition".into())),
    }
}
