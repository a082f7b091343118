//! Desired compositor state.
//!
//! Derived from the settings tree the orchestrator pushes. Replaced on every
//! `set config`, read by the reconciler on every pass, and never persisted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use babel_settings::{LanguageSettings, SettingsError, SettingsSubject, SubjectKind};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::compositor::{FilterState, InputState, MonitorType, StreamTarget};

pub const SCENE: &str = "main";
pub const ORIGINAL: &str = "original";
pub const TRANSLATION: &str = "translation";
pub const MEDIA: &str = "media";

/// Inputs the compositor ships with; never deleted.
pub const PROTECTED_INPUTS: &[&str] = &["Desktop Audio", "Mic/Aux"];

/// File stem suffix marking background-voice media.
pub const BACKGROUND_SUFFIX: &str = "_bg";

/// How far `original` is lowered under background-voice media.
pub const BACKGROUND_DUCK_DB: f64 = 12.0;

const SOURCE_KIND: &str = "ffmpeg_source";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Cut,
    Stinger,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub kind: TransitionKind,
    pub path: String,
    pub point: u64,
}

impl Default for Transition {
    fn default() -> Self {
        Self {
            kind: TransitionKind::Cut,
            path: String::new(),
            point: 0,
        }
    }
}

/// The clip that should be on air.
#[derive(Debug, Clone)]
pub struct PlayingMedia {
    pub name: String,
    pub path: PathBuf,
    pub started_at: Instant,
    /// Measured once the source exists.
    pub duration: Option<Duration>,
    /// Whether the source was created at least once. A missing source after
    /// that means the compositor lost it.
    pub created: bool,
}

impl PlayingMedia {
    pub fn new(name: impl Into<String>, media_dir: &Path) -> Self {
        let name = name.into();
        Self {
            path: media_dir.join(&name),
            name,
            started_at: Instant::now(),
            duration: None,
            created: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_background(&self) -> bool {
        Path::new(&self.name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem.ends_with(BACKGROUND_SUFFIX))
    }
}

#[derive(Debug, Clone)]
pub struct DesiredState {
    pub scene: String,
    pub inputs: BTreeMap<String, InputState>,
    pub stream: Option<StreamTarget>,
    pub transition: Transition,
    pub media: Option<PlayingMedia>,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            scene: SCENE.to_string(),
            inputs: BTreeMap::new(),
            stream: None,
            transition: Transition::default(),
            media: None,
        }
    }
}

fn invalid(subject: &SettingsSubject, field: &str, reason: &str) -> SettingsError {
    SettingsError::InvalidValue {
        key: format!("{}.{}", subject.kind(), field),
        reason: reason.to_string(),
    }
}

fn text<'a>(subject: &'a SettingsSubject, field: &str) -> Result<&'a str, SettingsError> {
    subject
        .get(field)?
        .as_str()
        .ok_or_else(|| invalid(subject, field, "expected a string"))
}

fn number(subject: &SettingsSubject, field: &str) -> Result<f64, SettingsError> {
    subject
        .get(field)?
        .as_f64()
        .ok_or_else(|| invalid(subject, field, "expected a number"))
}

fn flag(subject: &SettingsSubject, field: &str) -> Result<bool, SettingsError> {
    subject
        .get(field)?
        .as_bool()
        .ok_or_else(|| invalid(subject, field, "expected a boolean"))
}

fn monitor(subject: &SettingsSubject, field: &str) -> Result<MonitorType, SettingsError> {
    text(subject, field)?
        .parse()
        .map_err(|_| invalid(subject, field, "unknown monitor type"))
}

fn stream_source(url: &str) -> Value {
    json!({ "input": url, "is_local_file": false, "restart_on_activate": true })
}

impl DesiredState {
    /// Build from a pushed `{subject: {field: value}}` payload.
    pub fn from_push(payload: &Value) -> Result<Self, SettingsError> {
        Self::from_settings(&LanguageSettings::from_push(payload)?)
    }

    pub fn from_settings(tree: &LanguageSettings) -> Result<Self, SettingsError> {
        let source = tree.subject(SubjectKind::Source);
        let audio = tree.subject(SubjectKind::Audio);
        let sidechain = tree.subject(SubjectKind::Sidechain);
        let limiter = tree.subject(SubjectKind::Limiter);
        let gain = tree.subject(SubjectKind::Gain);
        let stream = tree.subject(SubjectKind::Stream);
        let transition = tree.subject(SubjectKind::Transition);

        let mut inputs = BTreeMap::new();

        let original_url = text(source, "original_url")?;
        if !original_url.is_empty() {
            let mut original = InputState::new(SOURCE_KIND, stream_source(original_url));
            original.volume = number(audio, "original_volume")?;
            original.monitor = monitor(audio, "original_monitor")?;
            original.filters.insert(
                "sidechain".to_string(),
                FilterState {
                    kind: "compressor_filter".to_string(),
                    settings: json!({
                        "ratio": number(sidechain, "ratio")?,
                        "threshold": number(sidechain, "threshold")?,
                        "release_time": number(sidechain, "release_time")?,
                        "output_gain": number(sidechain, "output_gain")?,
                        "sidechain_source": TRANSLATION,
                    }),
                    enabled: flag(sidechain, "enabled")?,
                },
            );
            inputs.insert(ORIGINAL.to_string(), original);
        }

        let translation_url = text(source, "translation_url")?;
        if !translation_url.is_empty() {
            let mut translation = InputState::new(SOURCE_KIND, stream_source(translation_url));
            translation.volume = number(audio, "translation_volume")?;
            translation.monitor = monitor(audio, "translation_monitor")?;
            translation.filters.insert(
                "limiter".to_string(),
                FilterState {
                    kind: "limiter_filter".to_string(),
                    settings: json!({
                        "threshold": number(limiter, "threshold")?,
                        "release_time": number(limiter, "release_time")?,
                    }),
                    enabled: flag(limiter, "enabled")?,
                },
            );
            translation.filters.insert(
                "gain".to_string(),
                FilterState {
                    kind: "gain_filter".to_string(),
                    settings: json!({ "db": number(gain, "gain")? }),
                    enabled: flag(gain, "enabled")?,
                },
            );
            inputs.insert(TRANSLATION.to_string(), translation);
        }

        let server = text(stream, "server")?;
        let stream = (!server.is_empty()).then(|| StreamTarget {
            server: server.to_string(),
            key: text(stream, "key").unwrap_or_default().to_string(),
        });

        let kind = match text(transition, "kind")? {
            "cut" => TransitionKind::Cut,
            "stinger" => TransitionKind::Stinger,
            _ => return Err(invalid(transition, "kind", "expected 'cut' or 'stinger'")),
        };
        let point = transition
            .get("point")?
            .as_u64()
            .ok_or_else(|| invalid(transition, "point", "expected a non-negative integer"))?;

        Ok(Self {
            scene: SCENE.to_string(),
            inputs,
            stream,
            transition: Transition {
                kind,
                path: text(transition, "path")?.to_string(),
                point,
            },
            media: None,
        })
    }

    /// The inputs to converge to, with the playing clip mixed in.
    pub fn effective_inputs(&self) -> BTreeMap<String, InputState> {
        let mut inputs = self.inputs.clone();
        let Some(media) = &self.media else {
            return inputs;
        };

        let mut clip = InputState::new(
            SOURCE_KIND,
            json!({
                "local_file": media.path.to_string_lossy(),
                "is_local_file": true,
                "restart_on_activate": false,
            }),
        );
        clip.monitor = MonitorType::MonitorAndOutput;
        inputs.insert(MEDIA.to_string(), clip);

        if media.is_background() {
            if let Some(original) = inputs.get_mut(ORIGINAL) {
                original.volume -= BACKGROUND_DUCK_DB;
            }
        } else {
            for name in [ORIGINAL, TRANSLATION] {
                if let Some(input) = inputs.get_mut(name) {
                    input.muted = true;
                }
            }
        }
        inputs
    }

    /// JSON view for `get info`.
    pub fn summary(&self) -> Value {
        json!({
            "scene": self.scene,
            "inputs": self.effective_inputs(),
            "stream": self.stream.as_ref().map(|s| &s.server),
            "transition": self.transition,
            "media": self.media.as_ref().map(|m| json!({
                "name": m.name,
                "elapsed": m.elapsed().as_secs_f64(),
                "duration": m.duration.map(|d| d.as_secs_f64()),
            })),
        })
    }
}

/// Desired state shared by the control server, the reconciler and the media
/// player.
#[derive(Debug, Clone, Default)]
pub struct SharedDesired(Arc<Mutex<DesiredState>>);

impl SharedDesired {
    pub fn new(state: DesiredState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn snapshot(&self) -> DesiredState {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut DesiredState) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Swap in freshly pushed settings, keeping the playing clip.
    pub fn replace_settings(&self, next: DesiredState) {
        self.update(|current| {
            let media = current.media.take();
            *current = DesiredState { media, ..next };
        });
    }
}
