//! Session command and response envelopes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Language wildcard accepted in the `lang` field.
pub const ALL_LANGUAGES: &str = "*";

/// A control command sent by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

/// Which languages a command addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LangScope {
    /// No `lang` field.
    Unspecified,
    /// `"*"`.
    All,
    /// A single language code.
    One(String),
}

impl LangScope {
    /// True for `Unspecified` and `All`.
    pub fn is_broad(&self) -> bool {
        !matches!(self, LangScope::One(_))
    }
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            details: None,
            lang: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    /// Parse and validate a raw text frame.
    ///
    /// The frame must be a JSON object with a string `command`; `details`, if
    /// present and not null, must be an object.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::Malformed("expected a JSON object".into()));
        };

        let command = match map.remove("command") {
            Some(Value::String(command)) if !command.trim().is_empty() => command,
            _ => return Err(ProtocolError::MissingCommand),
        };

        let details = match map.remove("details") {
            None | Some(Value::Null) => None,
            Some(details @ Value::Object(_)) => Some(details),
            Some(_) => return Err(ProtocolError::InvalidDetails),
        };

        let lang = match map.remove("lang") {
            None | Some(Value::Null) => None,
            Some(Value::String(lang)) => Some(lang),
            Some(other) => {
                return Err(ProtocolError::Malformed(format!(
                    "lang must be a string, got {other}"
                )))
            }
        };

        Ok(Self {
            command,
            details,
            lang,
        })
    }

    pub fn lang_scope(&self) -> LangScope {
        match self.lang.as_deref() {
            None | Some("") => LangScope::Unspecified,
            Some(ALL_LANGUAGES) => LangScope::All,
            Some(lang) => LangScope::One(lang.to_string()),
        }
    }

    /// Look up a required detail field.
    pub fn detail(&self, field: &str) -> Result<&Value, ProtocolError> {
        self.details
            .as_ref()
            .and_then(|d| d.get(field))
            .filter(|v| !v.is_null())
            .ok_or_else(|| ProtocolError::MissingDetail(field.to_string()))
    }

    /// Look up a required string detail field.
    pub fn detail_str(&self, field: &str) -> Result<&str, ProtocolError> {
        self.detail(field)?
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidDetail {
                field: field.to_string(),
                reason: "expected a string".into(),
            })
    }

    /// Look up an optional detail field (absent and null both yield `None`).
    pub fn optional_detail(&self, field: &str) -> Option<&Value> {
        self.details
            .as_ref()
            .and_then(|d| d.get(field))
            .filter(|v| !v.is_null())
    }
}

/// Response to a command; also the per-node reply payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: bool,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serializable_object: Option<Value>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: true,
            message: message.into(),
            serializable_object: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: message.into(),
            serializable_object: None,
        }
    }

    pub fn with_object(mut self, object: Value) -> Self {
        self.serializable_object = Some(object);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status
    }

    /// Combine per-language results into one.
    ///
    /// The status is the logical AND of every entry (true for an empty map),
    /// and the payload always carries one entry per language.
    pub fn aggregate(results: BTreeMap<String, CommandResult>) -> Self {
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, r)| !r.status)
            .map(|(lang, _)| lang.as_str())
            .collect();

        let message = if failed.is_empty() {
            format!("{} language(s) succeeded", results.len())
        } else {
            format!("failed for: {}", failed.join(", "))
        };
        let status = failed.is_empty();

        let object = results
            .into_iter()
            .map(|(lang, r)| {
                let value = serde_json::to_value(r).unwrap_or(Value::Null);
                (lang, value)
            })
            .collect::<serde_json::Map<_, _>>();

        Self {
            status,
            message,
            serializable_object: Some(Value::Object(object)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn parse_minimal_command() {
        let env = CommandEnvelope::parse(r#"{"command": "get info"}"#).unwrap();
        assert_eq!(env.command, "get info");
        assert_eq!(env.details, None);
        assert_eq!(env.lang_scope(), LangScope::Unspecified);
    }

    #[rstest]
    #[case("not json", "malformed")]
    #[case("[1, 2]", "malformed")]
    #[case(r#"{"details": {}}"#, "no command")]
    #[case(r#"{"command": 5}"#, "no command")]
    #[case(r#"{"command": "x", "details": [1]}"#, "details")]
    fn parse_rejects(#[case] input: &str, #[case] fragment: &str) {
        let err = CommandEnvelope::parse(input).unwrap_err();
        assert!(
            err.to_string().contains(fragment),
            "{err} does not mention {fragment}"
        );
    }

    #[rstest]
    #[case(None, LangScope::Unspecified)]
    #[case(Some("*"), LangScope::All)]
    #[case(Some("Fra"), LangScope::One("Fra".into()))]
    fn lang_scope(#[case] lang: Option<&str>, #[case] expected: LangScope) {
        let mut env = CommandEnvelope::new("play media");
        env.lang = lang.map(String::from);
        assert_eq!(env.lang_scope(), expected);
    }

    #[test]
    fn detail_lookup() {
        let env = CommandEnvelope::new("x").with_details(json!({"name": "a.mp4", "n": null}));
        assert_eq!(env.detail_str("name").unwrap(), "a.mp4");
        assert!(matches!(
            env.detail("n"),
            Err(ProtocolError::MissingDetail(_))
        ));
        assert!(env.optional_detail("missing").is_none());
    }

    #[test]
    fn aggregate_is_logical_and() {
        let mut results = BTreeMap::new();
        results.insert("Eng".to_string(), CommandResult::ok("done"));
        results.insert("Fra".to_string(), CommandResult::failure("timeout"));

        let combined = CommandResult::aggregate(results);
        assert!(!combined.status);
        let obj = combined.serializable_object.unwrap();
        assert_eq!(obj["Eng"]["status"], json!(true));
        assert_eq!(obj["Fra"]["status"], json!(false));
        assert!(combined.message.contains("Fra"));
    }

    #[test]
    fn aggregate_of_nothing_succeeds() {
        let combined = CommandResult::aggregate(BTreeMap::new());
        assert!(combined.status);
        assert_eq!(combined.serializable_object, Some(json!({})));
    }

    #[test]
    fn response_omits_absent_object() {
        let json = serde_json::to_value(CommandResult::ok("fine")).unwrap();
        assert_eq!(json, json!({"status": true, "message": "fine"}));
    }
}
