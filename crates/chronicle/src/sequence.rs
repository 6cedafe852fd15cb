//! # Sequence Resolver
//!
//! Derives the ordering value of an event from a prioritized list of
//! candidate fields, e.g. `[modified_at, created_at]` or a single log
//! position. The first non-null candidate wins.

use crate::error::{MaterializeError, Result};
use crate::event::ConvertedEvent;
use crate::value::{FieldValue, SequenceValue};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Naive timestamp layouts accepted in text candidates (interpreted as UTC).
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Resolves sequence values for one pipeline.
#[derive(Debug, Clone)]
pub struct SequenceResolver {
    candidates: Vec<String>,
}

impl SequenceResolver {
    /// Create a resolver over candidate fields in priority order.
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Return the first non-null candidate as a sequence value.
    pub fn resolve(&self, event: &ConvertedEvent) -> Result<SequenceValue> {
        for field in &self.candidates {
            if let Some(sequence) = to_sequence(field, event.get(field))? {
                return Ok(sequence);
            }
        }
        Err(MaterializeError::unorderable(&self.candidates))
    }
}

/// Interpret one field value as a sequence value. Null yields `None`.
pub fn to_sequence(field: &str, value: &FieldValue) -> Result<Option<SequenceValue>> {
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::Int(position) => Ok(Some(SequenceValue::Position(*position))),
        FieldValue::Timestamp(ts) => Ok(Some(SequenceValue::Timestamp(*ts))),
        FieldValue::Date(date) => Ok(date
            .and_hms_opt(0, 0, 0)
            .map(|dt| SequenceValue::Timestamp(Utc.from_utc_datetime(&dt)))),
        FieldValue::Text(s) => parse_timestamp(s)
            .map(|ts| Some(SequenceValue::Timestamp(ts)))
            .ok_or_else(|| {
                MaterializeError::malformed(field, value.to_string(), "unparseable timestamp")
            }),
        other => Err(MaterializeError::malformed(
            field,
            other.to_string(),
            format!("{} cannot order events", other.type_name()),
        )),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}
