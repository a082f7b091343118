//! A single settings subject and its state tag.

use std::collections::BTreeMap;

use babel_id::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::{coerce, SubjectKind};
use crate::SettingsError;

/// Reserved field name of the state tag.
pub const STATE_FIELD: &str = "state";

/// Tri-state tag tracking whether a subject's values are applied remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    /// Never configured.
    #[default]
    Unset,
    /// Changed since the last successful push.
    Modified,
    /// Confirmed applied on the node.
    Active,
}

/// A named group of configuration fields with a state tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSubject {
    kind: SubjectKind,
    state: ObjectState,
    revision: Revision,
    values: BTreeMap<String, Value>,
}

impl SettingsSubject {
    /// A subject holding its default values, tagged `unset`.
    pub fn new(kind: SubjectKind) -> Self {
        let values = kind
            .defaults()
            .into_iter()
            .map(|(field, value)| (field.to_string(), value))
            .collect();

        Self {
            kind,
            state: ObjectState::Unset,
            revision: Revision::ZERO,
            values,
        }
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn is_modified(&self) -> bool {
        self.state == ObjectState::Modified
    }

    pub fn is_active(&self) -> bool {
        self.state == ObjectState::Active
    }

    pub fn is_unset(&self) -> bool {
        self.state == ObjectState::Unset
    }

    fn key(&self, field: &str) -> String {
        format!("{}.{}", self.kind, field)
    }

    /// Read a field.
    pub fn get(&self, field: &str) -> Result<&Value, SettingsError> {
        if field == STATE_FIELD {
            return Err(SettingsError::InvalidKey(self.key(field)));
        }
        self.values
            .get(field)
            .ok_or_else(|| SettingsError::InvalidKey(self.key(field)))
    }

    /// Write a field.
    ///
    /// Returns `Ok(true)` when the value changed (the subject is now
    /// `modified`), `Ok(false)` when it already held that value (state tag
    /// untouched).
    pub fn set(&mut self, field: &str, value: Value) -> Result<bool, SettingsError> {
        let value = self.validate(field, value)?;
        if self.values.get(field) == Some(&value) {
            return Ok(false);
        }

        self.values.insert(field.to_string(), value);
        self.state = ObjectState::Modified;
        self.revision = self.revision.next();
        Ok(true)
    }

    fn validate(&self, field: &str, value: Value) -> Result<Value, SettingsError> {
        if field == STATE_FIELD {
            return Err(SettingsError::StateTagForbidden);
        }
        let current = self
            .values
            .get(field)
            .ok_or_else(|| SettingsError::InvalidKey(self.key(field)))?;
        if value.is_null() {
            return Err(SettingsError::InvalidValue {
                key: self.key(field),
                reason: "null is not a value".into(),
            });
        }
        coerce(&self.key(field), current, value)
    }

    /// Overlay every non-null field of `other` onto this subject.
    ///
    /// Null or absent fields leave the current value alone. All keys are
    /// validated before anything is written, so a bad key changes nothing.
    pub fn merge_from(&mut self, other: &Map<String, Value>) -> Result<bool, SettingsError> {
        let mut updates = Vec::new();
        for (field, value) in other {
            if value.is_null() {
                if field == STATE_FIELD {
                    return Err(SettingsError::StateTagForbidden);
                }
                self.get(field)?;
                continue;
            }
            updates.push((field.as_str(), self.validate(field, value.clone())?));
        }

        let mut changed = false;
        for (field, value) in updates {
            changed |= self.set(field, value)?;
        }
        Ok(changed)
    }

    /// Mark a modified subject as applied.
    ///
    /// Returns false (and does nothing) unless the subject is `modified`.
    pub fn activate(&mut self) -> bool {
        if self.state != ObjectState::Modified {
            return false;
        }
        self.state = ObjectState::Active;
        true
    }

    /// Activate only if no change happened since `revision` was observed.
    pub fn activate_at(&mut self, revision: Revision) -> bool {
        self.revision == revision && self.activate()
    }

    /// Return an active subject to `modified` so it is pushed again.
    pub fn deactivate(&mut self) -> bool {
        if self.state != ObjectState::Active {
            return false;
        }
        self.state = ObjectState::Modified;
        true
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// The `{field: value}` object pushed to nodes.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn stream() -> SettingsSubject {
        SettingsSubject::new(SubjectKind::Stream)
    }

    #[test]
    fn new_subject_is_unset() {
        let s = stream();
        assert!(s.is_unset());
        assert_eq!(s.revision(), Revision::ZERO);
        assert_eq!(s.get("server").unwrap(), &json!(""));
    }

    #[test]
    fn set_marks_modified() {
        let mut s = stream();
        assert!(s.set("server", json!("rtmp://a")).unwrap());
        assert!(s.is_modified());
        assert_eq!(s.revision(), Revision::new(1));
    }

    #[test]
    fn set_same_value_is_noop_for_unset_and_active() {
        let mut s = stream();
        assert!(!s.set("server", json!("")).unwrap());
        assert!(s.is_unset());

        s.set("server", json!("rtmp://a")).unwrap();
        s.activate();
        assert!(!s.set("server", json!("rtmp://a")).unwrap());
        assert!(s.is_active());
    }

    #[test]
    fn unknown_field_is_invalid_key() {
        let mut s = stream();
        assert_eq!(
            s.set("bitrate", json!(1)),
            Err(SettingsError::InvalidKey("stream.bitrate".into()))
        );
        assert!(s.get("bitrate").is_err());
    }

    #[test]
    fn state_tag_cannot_be_written() {
        let mut s = stream();
        assert_eq!(
            s.set(STATE_FIELD, json!("active")),
            Err(SettingsError::StateTagForbidden)
        );
        let mut overlay = Map::new();
        overlay.insert(STATE_FIELD.into(), json!("active"));
        assert_eq!(s.merge_from(&overlay), Err(SettingsError::StateTagForbidden));
        assert!(s.is_unset());
    }

    #[test]
    fn activate_twice_only_transitions_once() {
        let mut s = stream();
        s.set("key", json!("abc")).unwrap();
        assert!(s.activate());
        assert!(!s.activate());
    }

    #[test]
    fn activate_at_stale_revision_keeps_modified() {
        let mut s = stream();
        s.set("key", json!("abc")).unwrap();
        let seen = s.revision();
        s.set("key", json!("def")).unwrap();
        assert!(!s.activate_at(seen));
        assert!(s.is_modified());
        assert!(s.activate_at(s.revision()));
    }

    #[test]
    fn deactivate_only_affects_active() {
        let mut s = stream();
        assert!(!s.deactivate());
        s.set("key", json!("abc")).unwrap();
        s.activate();
        assert!(s.deactivate());
        assert!(s.is_modified());
    }

    #[test]
    fn merge_rejects_bad_key_without_partial_write() {
        let mut s = stream();
        let overlay = json!({"server": "rtmp://x", "nope": 1});
        let err = s.merge_from(overlay.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidKey(_)));
        assert_eq!(s.get("server").unwrap(), &json!(""));
    }

    proptest! {
        #[test]
        fn setting_current_value_never_changes_state(server in ".{0,16}", activate in any::<bool>()) {
            let mut s = stream();
            s.set("server", json!(server.clone())).unwrap();
            if activate {
                s.activate();
            }
            let before = s.state();
            let rev = s.revision();
            prop_assert!(!s.set("server", json!(server)).unwrap());
            prop_assert_eq!(s.state(), before);
            prop_assert_eq!(s.revision(), rev);
        }

        #[test]
        fn merge_never_overwrites_with_null(server in "[a-z]{1,8}", key in proptest::option::of("[a-z]{1,8}")) {
            let mut s = stream();
            s.set("key", json!("kept")).unwrap();
            let overlay = json!({"server": server.clone(), "key": key.clone()});
            s.merge_from(overlay.as_object().unwrap()).unwrap();
            prop_assert_eq!(s.get("server").unwrap(), &json!(server));
            let expected = key.unwrap_or_else(|| "kept".to_string());
            prop_assert_eq!(s.get("key").unwrap(), &json!(expected));
        }
    }
}
