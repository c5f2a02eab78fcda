//! Decoded subscription events
//!
//! Payload schemas differ per category and are not known statically, so an
//! event is a category tag plus an open key/value map. Callers wanting a typed
//! view can [`SubscriptionEvent::decode`] the map into their own struct.

use super::category::SubscriptionCategory;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// One record received from a subscription push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub category: SubscriptionCategory,
    pub data: Map<String, Value>,
    /// Captured when the push was decoded, not the server's event time
    pub timestamp: DateTime<Utc>,
}

impl SubscriptionEvent {
    pub fn new(category: SubscriptionCategory, data: Map<String, Value>) -> Self {
        Self {
            category,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Look up a top-level payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Remote identifier of the record, when the payload carries one
    pub fn id(&self) -> Option<i64> {
        self.data.get("id").and_then(Value::as_i64)
    }

    /// Decode the payload into a category-specific type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| Error::Parse {
            message: format!("Failed to decode {} event: {}", self.category, e),
        })
    }
}

impl fmt::Display for SubscriptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event: {} at {}", self.category, self.timestamp.to_rfc3339())
    }
}

/// Equality constraints an event must satisfy to be delivered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    fields: BTreeMap<String, Value>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// An empty filter matches everything; a missing field never matches
    pub fn matches(&self, event: &SubscriptionEvent) -> bool {
        self.fields
            .iter()
            .all(|(key, expected)| event.data.get(key) == Some(expected))
    }
}

impl FromIterator<(String, Value)> for EventFilter {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Split one push payload (a GraphQL execution result) into events.
///
/// The `data` object holds one root field per subscribed entity. A list
/// yields one event per record, in server order; a single object yields one
/// event; `null` yields none. Anything else is a malformed push.
pub(crate) fn decode_push(
    category: SubscriptionCategory,
    payload: &Value,
) -> std::result::Result<Vec<SubscriptionEvent>, String> {
    let result = payload
        .as_object()
        .ok_or_else(|| format!("expected a JSON object, got {}", kind(payload)))?;

    let data = match result.get("data") {
        Some(Value::Object(data)) => data,
        Some(Value::Null) | None => {
            return Err(match result.get("errors").and_then(Value::as_array) {
                Some(errors) if !errors.is_empty() => {
                    format!("server returned errors: {}", error_messages(errors))
                }
                _ => "push carried no data".to_string(),
            });
        }
        Some(other) => return Err(format!("expected `data` to be an object, got {}", kind(other))),
    };

    let timestamp = Utc::now();
    let mut events = Vec::new();
    for (field, value) in data {
        match value {
            Value::Array(records) => {
                for record in records {
                    let record = record.as_object().ok_or_else(|| {
                        format!("`{}` contains a {} instead of a record", field, kind(record))
                    })?;
                    events.push(SubscriptionEvent {
                        category,
                        data: record.clone(),
                        timestamp,
                    });
                }
            }
            Value::Object(record) => events.push(SubscriptionEvent {
                category,
                data: record.clone(),
                timestamp,
            }),
            Value::Null => {}
            other => return Err(format!("`{}` is a {}, not a record set", field, kind(other))),
        }
    }
    Ok(events)
}

fn error_messages(errors: &[Value]) -> String {
    errors
        .iter()
        .map(|e| {
            e.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
