//! A language's ordered settings tree.

use babel_id::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{SettingsError, SettingsSubject, SubjectKind};

/// The full settings tree of one language.
///
/// Subjects are kept in [`SubjectKind::ALL`] order. Nothing but the
/// connection subject can be pushed or activated while the connection subject
/// is not `active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<SettingsSubject>", into = "Vec<SettingsSubject>")]
pub struct LanguageSettings {
    subjects: Vec<SettingsSubject>,
}

/// What an activation round pushes for one language.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPush {
    /// `{subject: {field: value}}` for the whole tree.
    pub payload: Value,
    /// Revisions of the modified subjects at collection time.
    pub revisions: Vec<(SubjectKind, Revision)>,
}

impl Default for LanguageSettings {
    fn default() -> Self {
        Self {
            subjects: SubjectKind::ALL
                .into_iter()
                .map(SettingsSubject::new)
                .collect(),
        }
    }
}

impl LanguageSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a pushed `{subject: {field: value}}` payload.
    pub fn from_push(payload: &Value) -> Result<Self, SettingsError> {
        let mut tree = Self::new();
        tree.merge_from(payload)?;
        Ok(tree)
    }

    pub fn subjects(&self) -> &[SettingsSubject] {
        &self.subjects
    }

    pub fn subject(&self, kind: SubjectKind) -> &SettingsSubject {
        // Every kind is present by construction.
        &self.subjects[kind as usize]
    }

    fn subject_mut(&mut self, kind: SubjectKind) -> &mut SettingsSubject {
        &mut self.subjects[kind as usize]
    }

    pub fn subject_by_name(&self, name: &str) -> Result<&SettingsSubject, SettingsError> {
        Ok(self.subject(SubjectKind::from_name(name)?))
    }

    pub fn connection(&self) -> &SettingsSubject {
        self.subject(SubjectKind::Connection)
    }

    /// Whether the node behind this tree has been reached.
    pub fn is_reachable(&self) -> bool {
        self.connection().is_active()
    }

    pub fn get(&self, subject: &str, field: &str) -> Result<&Value, SettingsError> {
        self.subject_by_name(subject)?.get(field)
    }

    pub fn set(&mut self, subject: &str, field: &str, value: Value) -> Result<bool, SettingsError> {
        let kind = SubjectKind::from_name(subject)?;
        self.subject_mut(kind).set(field, value)
    }

    /// Sparse overlay of `{subject: {field: value}}`.
    ///
    /// Null subjects and null fields are skipped. The whole overlay is
    /// validated against a scratch copy first so a bad key leaves the tree
    /// untouched.
    pub fn merge_from(&mut self, overlay: &Value) -> Result<bool, SettingsError> {
        let Value::Object(subjects) = overlay else {
            return Err(SettingsError::InvalidTree(
                "expected an object of subjects".into(),
            ));
        };

        let mut scratch = self.clone();
        let mut changed = false;
        for (name, fields) in subjects {
            let kind = SubjectKind::from_name(name)?;
            match fields {
                Value::Null => continue,
                Value::Object(fields) => {
                    changed |= scratch.subject_mut(kind).merge_from(fields)?;
                }
                _ => {
                    return Err(SettingsError::InvalidTree(format!(
                        "subject '{name}' must be an object"
                    )))
                }
            }
        }

        *self = scratch;
        Ok(changed)
    }

    /// Activate one subject, honoring the connection-first rule.
    pub fn activate_subject(&mut self, kind: SubjectKind) -> Result<bool, SettingsError> {
        if kind != SubjectKind::Connection && !self.is_reachable() {
            return Err(SettingsError::ConnectionNotActive);
        }
        Ok(self.subject_mut(kind).activate())
    }

    /// Activate the connection subject if it was not changed since `revision`.
    pub fn activate_connection_at(&mut self, revision: Revision) -> bool {
        self.subject_mut(SubjectKind::Connection)
            .activate_at(revision)
    }

    /// True when some subject other than the connection waits for a push.
    pub fn needs_push(&self) -> bool {
        self.subjects
            .iter()
            .skip(1)
            .any(SettingsSubject::is_modified)
    }

    /// Collect what must be pushed, or `None` when nothing is modified.
    pub fn pending_push(&self) -> Result<Option<PendingPush>, SettingsError> {
        if !self.needs_push() {
            return Ok(None);
        }
        if !self.is_reachable() {
            return Err(SettingsError::ConnectionNotActive);
        }

        let revisions = self
            .subjects
            .iter()
            .skip(1)
            .filter(|s| s.is_modified())
            .map(|s| (s.kind(), s.revision()))
            .collect();

        Ok(Some(PendingPush {
            payload: self.to_push_json(),
            revisions,
        }))
    }

    /// Mark pushed subjects active, skipping any modified again since.
    ///
    /// Returns how many subjects became active.
    pub fn record_push(
        &mut self,
        revisions: &[(SubjectKind, Revision)],
    ) -> Result<usize, SettingsError> {
        if !self.is_reachable() {
            return Err(SettingsError::ConnectionNotActive);
        }
        Ok(revisions
            .iter()
            .filter(|(kind, rev)| self.subject_mut(*kind).activate_at(*rev))
            .count())
    }

    /// Return every active subject to `modified`.
    pub fn deactivate_all(&mut self) {
        for subject in &mut self.subjects {
            subject.deactivate();
        }
    }

    /// `{subject: {field: value}}` for every subject.
    pub fn to_push_json(&self) -> Value {
        let map: Map<String, Value> = self
            .subjects
            .iter()
            .map(|s| (s.kind().name().to_string(), s.to_json()))
            .collect();
        Value::Object(map)
    }

    /// `{subject: state}` summary.
    pub fn states(&self) -> Value {
        let map: Map<String, Value> = self
            .subjects
            .iter()
            .map(|s| {
                (
                    s.kind().name().to_string(),
                    serde_json::to_value(s.state()).unwrap_or(Value::Null),
                )
            })
            .collect();
        Value::Object(map)
    }
}

impl TryFrom<Vec<SettingsSubject>> for LanguageSettings {
    type Error = SettingsError;

    fn try_from(subjects: Vec<SettingsSubject>) -> Result<Self, Self::Error> {
        let kinds: Vec<SubjectKind> = subjects.iter().map(SettingsSubject::kind).collect();
        if kinds != SubjectKind::ALL {
            return Err(SettingsError::InvalidTree(format!(
                "subjects out of order or missing: {kinds:?}"
            )));
        }
        Ok(Self { subjects })
    }
}

impl From<LanguageSettings> for Vec<SettingsSubject> {
    fn from(tree: LanguageSettings) -> Self {
        tree.subjects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectState;
    use serde_json::json;

    fn reachable() -> LanguageSettings {
        let mut tree = LanguageSettings::new();
        tree.set("connection", "host", json!("10.0.0.5")).unwrap();
        tree.activate_subject(SubjectKind::Connection).unwrap();
        tree
    }

    #[test]
    fn subjects_are_indexed_by_kind() {
        let tree = LanguageSettings::new();
        for kind in SubjectKind::ALL {
            assert_eq!(tree.subject(kind).kind(), kind);
        }
    }

    #[test]
    fn non_connection_needs_reachable_node() {
        let mut tree = LanguageSettings::new();
        tree.set("stream", "key", json!("abc")).unwrap();
        assert_eq!(
            tree.activate_subject(SubjectKind::Stream),
            Err(SettingsError::ConnectionNotActive)
        );
        assert_eq!(tree.pending_push(), Err(SettingsError::ConnectionNotActive));
    }

    #[test]
    fn pending_push_lists_modified_revisions() {
        let mut tree = reachable();
        assert_eq!(tree.pending_push().unwrap(), None);

        tree.set("stream", "key", json!("abc")).unwrap();
        tree.set("audio", "original_volume", json!(-6)).unwrap();
        let pending = tree.pending_push().unwrap().unwrap();
        assert_eq!(
            pending.revisions,
            vec![
                (SubjectKind::Stream, Revision::new(1)),
                (SubjectKind::Audio, Revision::new(1)),
            ]
        );
        assert_eq!(pending.payload["audio"]["original_volume"], json!(-6.0));

        assert_eq!(tree.record_push(&pending.revisions).unwrap(), 2);
        assert!(!tree.needs_push());
        // Pushing the same revisions again is a no-op.
        assert_eq!(tree.record_push(&pending.revisions).unwrap(), 0);
    }

    #[test]
    fn change_during_push_stays_modified() {
        let mut tree = reachable();
        tree.set("stream", "key", json!("abc")).unwrap();
        let pending = tree.pending_push().unwrap().unwrap();
        tree.set("stream", "key", json!("def")).unwrap();
        assert_eq!(tree.record_push(&pending.revisions).unwrap(), 0);
        assert_eq!(
            tree.subject(SubjectKind::Stream).state(),
            ObjectState::Modified
        );
    }

    #[test]
    fn merge_is_sparse_and_atomic() {
        let mut tree = LanguageSettings::new();
        tree.set("stream", "key", json!("keep")).unwrap();

        let changed = tree
            .merge_from(&json!({
                "stream": {"server": "rtmp://x", "key": null},
                "limiter": null,
            }))
            .unwrap();
        assert!(changed);
        assert_eq!(tree.get("stream", "key").unwrap(), &json!("keep"));
        assert_eq!(tree.get("stream", "server").unwrap(), &json!("rtmp://x"));

        let err = tree
            .merge_from(&json!({"stream": {"server": "rtmp://y"}, "bogus": {}}))
            .unwrap_err();
        assert_eq!(err, SettingsError::InvalidKey("bogus".into()));
        assert_eq!(tree.get("stream", "server").unwrap(), &json!("rtmp://x"));
    }

    #[test]
    fn snapshot_roundtrip_preserves_state() {
        let mut tree = reachable();
        tree.set("gain", "gain", json!(3.5)).unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        let back: LanguageSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
        assert!(back.is_reachable());
    }

    #[test]
    fn misordered_snapshot_is_rejected() {
        let mut subjects: Vec<SettingsSubject> = LanguageSettings::new().into();
        subjects.swap(0, 1);
        let json = serde_json::to_string(&subjects).unwrap();
        assert!(serde_json::from_str::<LanguageSettings>(&json).is_err());
    }

    #[test]
    fn deactivate_all_requeues_everything_active() {
        let mut tree = reachable();
        tree.set("stream", "key", json!("abc")).unwrap();
        let pending = tree.pending_push().unwrap().unwrap();
        tree.record_push(&pending.revisions).unwrap();

        tree.deactivate_all();
        assert!(!tree.is_reachable());
        assert!(tree.subject(SubjectKind::Stream).is_modified());
        assert!(tree.subject(SubjectKind::Gain).is_unset());
    }
}
