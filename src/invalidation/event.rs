//! Domain change events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of mutation an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityOperation {
    Create,
    Update,
    Delete,
    /// Bulk import or batch mutation touching many entities
    Bulk,
}

impl EntityOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityOperation::Create => "create",
            EntityOperation::Update => "update",
            EntityOperation::Delete => "delete",
            EntityOperation::Bulk => "bulk",
        }
    }

    /// Verb used in event type names, e.g. `requirement.updated`
    pub fn past_tense(&self) -> &'static str {
        match self {
            EntityOperation::Create => "created",
            EntityOperation::Update => "updated",
            EntityOperation::Delete => "deleted",
            EntityOperation::Bulk => "imported",
        }
    }
}

impl fmt::Display for EntityOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain mutation, dispatched locally and published on the
/// `invalidation` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    /// Event type matched against rule triggers, e.g. `requirement.updated`
    #[serde(rename = "type")]
    pub event_type: String,

    pub entity_type: String,

    pub entity_id: String,

    pub operation: EntityOperation,

    /// Free-form payload addressed by `{data.<field>}` placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Instance that published the event; peers skip their own echoes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl InvalidationEvent {
    /// Event of type `{entity_type}.{past tense of operation}`
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: EntityOperation,
    ) -> Self {
        let entity_type = entity_type.into();
        Self {
            event_type: format!("{}.{}", entity_type, operation.past_tense()),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            data: None,
            timestamp: Utc::now(),
            user_id: None,
            origin: None,
        }
    }

    /// Override the event type
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Look up a field of `data` by dotted path (`project.id`)
    pub fn data_field(&self, path: &str) -> Option<&Value> {
        let mut current = self.data.as_ref()?;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    /// A `data` field rendered as text; strings are unquoted
    pub fn data_text(&self, path: &str) -> Option<String> {
        self.data_field(path).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
