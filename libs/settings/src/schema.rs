//! Subject kinds, their fields and default values.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::SettingsError;

/// A named group of fields inside a language's settings tree.
///
/// The declaration order is the tree order, and `Connection` must stay first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Connection,
    Source,
    Stream,
    Audio,
    Sidechain,
    Limiter,
    Gain,
    Transition,
}

impl SubjectKind {
    pub const ALL: [SubjectKind; 8] = [
        SubjectKind::Connection,
        SubjectKind::Source,
        SubjectKind::Stream,
        SubjectKind::Audio,
        SubjectKind::Sidechain,
        SubjectKind::Limiter,
        SubjectKind::Gain,
        SubjectKind::Transition,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SubjectKind::Connection => "connection",
            SubjectKind::Source => "source",
            SubjectKind::Stream => "stream",
            SubjectKind::Audio => "audio",
            SubjectKind::Sidechain => "sidechain",
            SubjectKind::Limiter => "limiter",
            SubjectKind::Gain => "gain",
            SubjectKind::Transition => "transition",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, SettingsError> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == name)
            .ok_or_else(|| SettingsError::InvalidKey(name.to_string()))
    }

    /// Field names and defaults, in display order.
    pub fn defaults(&self) -> Vec<(&'static str, Value)> {
        match self {
            SubjectKind::Connection => vec![
                ("host", json!("")),
                ("port", json!(4455)),
                ("password", json!("")),
            ],
            SubjectKind::Source => vec![
                ("original_url", json!("")),
                ("translation_url", json!("")),
            ],
            SubjectKind::Stream => vec![("server", json!("")), ("key", json!(""))],
            SubjectKind::Audio => vec![
                ("original_volume", json!(0.0)),
                ("translation_volume", json!(0.0)),
                ("original_monitor", json!("none")),
                ("translation_monitor", json!("monitor_and_output")),
            ],
            SubjectKind::Sidechain => vec![
                ("enabled", json!(false)),
                ("ratio", json!(32.0)),
                ("threshold", json!(-30.0)),
                ("release_time", json!(300)),
                ("output_gain", json!(0.0)),
            ],
            SubjectKind::Limiter => vec![
                ("enabled", json!(false)),
                ("threshold", json!(-6.0)),
                ("release_time", json!(60)),
            ],
            SubjectKind::Gain => vec![("enabled", json!(false)), ("gain", json!(0.0))],
            SubjectKind::Transition => vec![
                ("kind", json!("cut")),
                ("path", json!("")),
                ("point", json!(0)),
            ],
        }
    }
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Coerce `value` to the JSON type of `default`.
///
/// Float fields accept integers, integer fields accept integral floats, and
/// anything else must match exactly.
pub(crate) fn coerce(key: &str, default: &Value, value: Value) -> Result<Value, SettingsError> {
    let invalid = |reason: &str| SettingsError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    match default {
        Value::String(_) => match value {
            Value::String(_) => Ok(value),
            _ => Err(invalid("expected a string")),
        },
        Value::Bool(_) => match value {
            Value::Bool(_) => Ok(value),
            _ => Err(invalid("expected a boolean")),
        },
        Value::Number(n) if n.is_f64() => value
            .as_f64()
            .map(|f| json!(f))
            .ok_or_else(|| invalid("expected a number")),
        Value::Number(_) => match value.as_i64() {
            Some(i) => Ok(json!(i)),
            None => match value.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(json!(f as i64)),
                _ => Err(invalid("expected an integer")),
            },
        },
        _ => Ok(value),
    }
}
