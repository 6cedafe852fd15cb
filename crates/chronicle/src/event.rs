//! Event representation
//!
//! An event moves through three shapes on its way into a target:
//!
//! ```text
//! RawEvent ──convert──▶ ConvertedEvent ──project──▶ NormalizedEvent
//!                            │
//!                            ├── natural key
//!                            └── sequence value
//! ```
//!
//! Key and sequence are read from the converted event so that fields used for
//! ordering can still be excluded from the final projection.

use crate::error::{MaterializeError, Result};
use crate::value::{FieldValue, NaturalKey};
use std::collections::{BTreeMap, BTreeSet};

/// Field name to value mapping. Ordered so output is deterministic.
pub type Row = BTreeMap<String, FieldValue>;

static NULL: FieldValue = FieldValue::Null;

/// A change event as delivered by the source, before any conversion.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RawEvent {
    pub fields: Row,
}

impl RawEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field (builder pattern).
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Get a field; missing fields read as null.
    pub fn get(&self, field: &str) -> &FieldValue {
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Build from a JSON object.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => Ok(Self {
                fields: map
                    .into_iter()
                    .map(|(k, v)| (k, FieldValue::from(v)))
                    .collect(),
            }),
            other => Err(MaterializeError::malformed(
                "<event>",
                other.to_string(),
                "event must be a JSON object",
            )),
        }
    }
}

impl From<Row> for RawEvent {
    fn from(fields: Row) -> Self {
        Self { fields }
    }
}

/// A raw event after type conversion, with every field still present.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedEvent {
    pub fields: Row,
    /// Fields nulled out under the `null_field` malformed policy
    pub nullified: Vec<String>,
}

impl ConvertedEvent {
    /// Get a field; missing fields read as null.
    pub fn get(&self, field: &str) -> &FieldValue {
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Extract the natural key tuple for the given key fields.
    pub fn natural_key(&self, key_fields: &[String]) -> NaturalKey {
        key_fields.iter().map(|f| self.get(f).clone()).collect()
    }

    /// Drop excluded fields, producing the event that is merged into targets.
    pub fn project(self, exclude: &BTreeSet<String>) -> NormalizedEvent {
        let mut fields = self.fields;
        if !exclude.is_empty() {
            fields.retain(|name, _| !exclude.contains(name));
        }
        NormalizedEvent { fields }
    }
}

/// A converted and projected event, ready to merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedEvent {
    pub fields: Row,
}

impl NormalizedEvent {
    pub fn new(fields: Row) -> Self {
        Self { fields }
    }

    /// Get a field; missing fields read as null.
    pub fn get(&self, field: &str) -> &FieldValue {
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Number of non-null fields.
    pub fn non_null_count(&self) -> usize {
        self.fields.values().filter(|v| !v.is_null()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_event_from_json() {
        let event = RawEvent::from_json(json!({"id": 1, "name": "Alice", "email": null})).unwrap();
        assert_eq!(event.get("id"), &FieldValue::Int(1));
        assert_eq!(event.get("email"), &FieldValue::Null);
        assert_eq!(event.get("missing"), &FieldValue::Null);
    }

    #[test]
    fn test_raw_event_rejects_non_object() {
        let err = RawEvent::from_json(json!([1, 2, 3])).unwrap_err();
        assert_eq!(err.error_code(), "malformed_field");
    }

    #[test]
    fn test_natural_key_missing_field_is_null() {
        let converted = ConvertedEvent {
            fields: RawEvent::new().with("tenant", "acme").fields,
            nullified: Vec::new(),
        };
        let key = converted.natural_key(&["tenant".into(), "id".into()]);
        assert_eq!(key.parts(), &[FieldValue::from("acme"), FieldValue::Null]);
    }

    #[test]
    fn test_project_drops_excluded() {
        let converted = ConvertedEvent {
            fields: RawEvent::new()
                .with("id", 1)
                .with("_rescued", "x")
                .with("name", "a")
                .fields,
            nullified: Vec::new(),
        };
        let exclude: BTreeSet<String> = ["_rescued".to_string()].into_iter().collect();
        let normalized = converted.project(&exclude);
        assert_eq!(normalized.fields.len(), 2);
        assert!(!normalized.fields.contains_key("_rescued"));
        assert_eq!(normalized.non_null_count(), 2);
    }
}
