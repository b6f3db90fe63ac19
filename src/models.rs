use crate::errors::{SyncError, SyncResult};
use crate::store::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Prompt,
    Folder,
    Settings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::Prompt, Self::Folder, Self::Settings];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Folder => "folder",
            Self::Settings => "settings",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative `(revision, data)` snapshot exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionEnvelope<T> {
    pub id: String,
    pub revision: u64,
    pub data: T,
}

impl<T> RevisionEnvelope<T> {
    pub fn new(id: impl Into<String>, revision: u64, data: T) -> Self {
        Self {
            id: id.into(),
            revision,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionPayloadEntity<T> {
    pub id: String,
    pub expected_revision: u64,
    pub data: T,
}

/// Parsed shape of a backend reply.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Success(Value),
    Conflict(Value),
    Failure(String),
}

impl InvokeOutcome {
    /// Accepts `{ success, payload }` mutation replies as well as load-style
    /// `{ success: true, ...data }` replies, where the body is everything
    /// except the `success` flag.
    pub fn from_value(value: Value) -> SyncResult<Self> {
        let Value::Object(mut object) = value else {
            return Err(SyncError::InvalidResponse(
                "backend reply is not an object".to_string(),
            ));
        };
        let success = object
            .remove("success")
            .and_then(|flag| flag.as_bool())
            .ok_or_else(|| {
                SyncError::InvalidResponse("backend reply is missing `success`".to_string())
            })?;

        if success {
            let body = match object.remove("payload") {
                Some(payload) => payload,
                None => Value::Object(object),
            };
            return Ok(Self::Success(body));
        }

        let conflict = object
            .get("conflict")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if conflict {
            let payload = object.remove("payload").unwrap_or(Value::Null);
            return Ok(Self::Conflict(payload));
        }

        let message = object
            .remove("error")
            .and_then(|error| match error {
                Value::String(message) => Some(message),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .unwrap_or_else(|| "backend reported failure without a message".to_string());
        Ok(Self::Failure(message))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptRecord {
    pub id: String,
    pub folder_id: Option<String>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub prompt_order: Vec<String>,
}

/// Workspace-level preferences. Numeric inputs are kept as typed text so a
/// half-typed value stays visible while it is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRecord {
    pub id: String,
    pub editor_font_size: String,
    pub wrap_lines: bool,
    pub default_folder_id: Option<String>,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self {
            id: "workspace".to_string(),
            editor_font_size: "14".to_string(),
            wrap_lines: true,
            default_folder_id: None,
        }
    }
}

impl Record for PromptRecord {
    const KIND: EntityKind = EntityKind::Prompt;

    fn key(&self) -> &str {
        &self.id
    }
}

impl Record for FolderRecord {
    const KIND: EntityKind = EntityKind::Folder;

    fn key(&self) -> &str {
        &self.id
    }
}

impl Record for SettingsRecord {
    const KIND: EntityKind = EntityKind::Settings;

    fn key(&self) -> &str {
        &self.id
    }
}

/// Body of a successful `workspace_load` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSnapshot {
    #[serde(default)]
    pub prompt: Vec<RevisionEnvelope<PromptRecord>>,
    #[serde(default)]
    pub folder: Vec<RevisionEnvelope<FolderRecord>>,
    #[serde(default)]
    pub settings: Vec<RevisionEnvelope<SettingsRecord>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::{EntityKind, InvokeOutcome, RevisionPayloadEntity};
    use serde_json::json;

    #[test]
    fn parses_success_conflict_and_failure_replies() {
        let success = InvokeOutcome::from_value(json!({"success": true, "payload": {"a": 1}}))
            .expect("success reply");
        assert_eq!(success, InvokeOutcome::Success(json!({"a": 1})));

        let conflict = InvokeOutcome::from_value(
            json!({"success": false, "conflict": true, "payload": {"b": 2}}),
        )
        .expect("conflict reply");
        assert_eq!(conflict, InvokeOutcome::Conflict(json!({"b": 2})));

        let failure = InvokeOutcome::from_value(json!({"success": false, "error": "disk full"}))
            .expect("failure reply");
        assert_eq!(failure, InvokeOutcome::Failure("disk full".to_string()));
    }

    #[test]
    fn load_style_success_keeps_remaining_fields() {
        let outcome = InvokeOutcome::from_value(json!({"success": true, "prompt": [], "cursor": 3}))
            .expect("load reply");
        assert_eq!(outcome, InvokeOutcome::Success(json!({"prompt": [], "cursor": 3})));
    }

    #[test]
    fn rejects_replies_without_success_flag() {
        let err = InvokeOutcome::from_value(json!({"payload": {}})).expect_err("missing flag");
        assert_eq!(err.code(), "INVALID_RESPONSE");
    }

    #[test]
    fn payload_entity_uses_camel_case_on_the_wire() {
        let entity = RevisionPayloadEntity {
            id: "p1".to_string(),
            expected_revision: 4,
            data: json!({"title": "A"}),
        };
        let value = serde_json::to_value(&entity).expect("serialize");
        assert_eq!(value["expectedRevision"], 4);
        assert_eq!(EntityKind::from_wire("folder"), Some(EntityKind::Folder));
        assert_eq!(EntityKind::from_wire("atom"), None);
    }
}
