//! # Type & Field Normalizer
//!
//! Converts source encodings into semantic types before any key or sequence
//! logic runs.
//!
//! | Declared as | Accepted input | Output |
//! |-------------|----------------|--------|
//! | `epoch_day_fields` | int days since 1970-01-01, numeric text, date | `Date` |
//! | `epoch_micro_fields` | int microseconds since epoch, numeric text, timestamp | `Timestamp` |
//! | `binary_id_fields` | bytes, base64 text, JSON byte array | lowercase hex `Text` |
//!
//! Null input always yields null output. Anything else is a
//! [`MaterializeError::MalformedField`], handled per [`MalformedFieldPolicy`].

use crate::config::{MalformedFieldPolicy, PipelineDescription};
use crate::error::{MaterializeError, Result};
use crate::event::{ConvertedEvent, NormalizedEvent, RawEvent};
use crate::value::FieldValue;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate};
use std::collections::BTreeSet;
use tracing::warn;

/// Days from 0001-01-01 (day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Semantic conversion applied to a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldConversion {
    EpochDay,
    EpochMicros,
    BinaryId,
}

impl FieldConversion {
    /// Convert a single value. Null passes through.
    pub fn apply(&self, field: &str, value: &FieldValue) -> Result<FieldValue> {
        if value.is_null() {
            return Ok(FieldValue::Null);
        }
        match self {
            FieldConversion::EpochDay => epoch_day_to_date(field, value),
            FieldConversion::EpochMicros => epoch_micros_to_timestamp(field, value),
            FieldConversion::BinaryId => binary_to_hex(field, value),
        }
    }
}

/// Convert days since the Unix epoch to a calendar date.
pub fn epoch_day_to_date(field: &str, value: &FieldValue) -> Result<FieldValue> {
    let days = match value {
        FieldValue::Date(_) => return Ok(value.clone()),
        other => integral(field, other, "epoch day")?,
    };
    i32::try_from(days)
        .ok()
        .and_then(|d| d.checked_add(UNIX_EPOCH_DAYS_FROM_CE))
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .map(FieldValue::Date)
        .ok_or_else(|| {
            MaterializeError::malformed(field, days.to_string(), "epoch day out of date range")
        })
}

/// Convert microseconds since the Unix epoch to a UTC timestamp.
pub fn epoch_micros_to_timestamp(field: &str, value: &FieldValue) -> Result<FieldValue> {
    let micros = match value {
        FieldValue::Timestamp(_) => return Ok(value.clone()),
        other => integral(field, other, "epoch microseconds")?,
    };
    DateTime::from_timestamp_micros(micros)
        .map(FieldValue::Timestamp)
        .ok_or_else(|| {
            MaterializeError::malformed(
                field,
                micros.to_string(),
                "epoch microseconds out of timestamp range",
            )
        })
}

/// Render a binary identifier as lowercase hex.
pub fn binary_to_hex(field: &str, value: &FieldValue) -> Result<FieldValue> {
    let bytes = match value {
        FieldValue::Bytes(b) => b.clone(),
        FieldValue::Text(s) => BASE64.decode(s.trim()).map_err(|e| {
            MaterializeError::malformed(field, value.to_string(), format!("invalid base64: {}", e))
        })?,
        FieldValue::Json(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| {
                MaterializeError::malformed(field, value.to_string(), "array is not a byte sequence")
            })?,
        other => {
            return Err(MaterializeError::malformed(
                field,
                other.to_string(),
                format!("cannot read {} as binary identifier", other.type_name()),
            ))
        }
    };
    if bytes.is_empty() {
        return Err(MaterializeError::malformed(
            field,
            value.to_string(),
            "binary identifier is empty",
        ));
    }
    Ok(FieldValue::Text(hex::encode(bytes)))
}

fn integral(field: &str, value: &FieldValue, what: &str) -> Result<i64> {
    match value {
        FieldValue::Int(i) => Ok(*i),
        FieldValue::Text(s) => s.trim().parse::<i64>().map_err(|_| {
            MaterializeError::malformed(field, value.to_string(), format!("{} is not an integer", what))
        }),
        other => Err(MaterializeError::malformed(
            field,
            other.to_string(),
            format!("expected integer {}, got {}", what, other.type_name()),
        )),
    }
}

/// Field normalizer resolved from a pipeline description.
#[derive(Debug, Clone)]
pub struct FieldNormalizer {
    conversions: Vec<(String, FieldConversion)>,
    exclude_fields: BTreeSet<String>,
    policy: MalformedFieldPolicy,
}

impl FieldNormalizer {
    /// Create a normalizer for a pipeline.
    pub fn new(description: &PipelineDescription) -> Self {
        let mut conversions = Vec::new();
        conversions.extend(
            description
                .epoch_day_fields
                .iter()
                .map(|f| (f.clone(), FieldConversion::EpochDay)),
        );
        conversions.extend(
            description
                .epoch_micro_fields
                .iter()
                .map(|f| (f.clone(), FieldConversion::EpochMicros)),
        );
        conversions.extend(
            description
                .binary_id_fields
                .iter()
                .map(|f| (f.clone(), FieldConversion::BinaryId)),
        );

        Self {
            conversions,
            exclude_fields: description.exclude_fields.clone(),
            policy: description.malformed_fields,
        }
    }

    /// Apply declared conversions. Every field is kept.
    pub fn convert(&self, raw: RawEvent) -> Result<ConvertedEvent> {
        let mut fields = raw.fields;
        let mut nullified = Vec::new();

        for (field, conversion) in &self.conversions {
            let Some(value) = fields.get_mut(field) else {
                continue;
            };
            match conversion.apply(field, value) {
                Ok(converted) => *value = converted,
                Err(e) => match self.policy {
                    MalformedFieldPolicy::RejectEvent => return Err(e),
                    MalformedFieldPolicy::NullField => {
                        warn!("Nulling field after failed conversion: {}", e);
                        *value = FieldValue::Null;
                        nullified.push(field.clone());
                    }
                },
            }
        }

        Ok(ConvertedEvent { fields, nullified })
    }

    /// The value `field` will hold after [`convert`](Self::convert), without
    /// logging. A value the event would be rejected for is returned as is.
    pub fn converted_value(&self, field: &str, value: &FieldValue) -> FieldValue {
        let mut current = value.clone();
        for (_, conversion) in self.conversions.iter().filter(|(f, _)| f == field) {
            match conversion.apply(field, &current) {
                Ok(converted) => current = converted,
                Err(_) => {
                    return match self.policy {
                        MalformedFieldPolicy::RejectEvent => value.clone(),
                        MalformedFieldPolicy::NullField => FieldValue::Null,
                    }
                }
            }
        }
        current
    }

    /// Drop excluded fields.
    pub fn project(&self, converted: ConvertedEvent) -> NormalizedEvent {
        converted.project(&self.exclude_fields)
    }

    /// Convert and project in one step.
    pub fn normalize(&self, raw: RawEvent) -> Result<NormalizedEvent> {
        Ok(self.project(self.convert(raw)?))
    }
}
