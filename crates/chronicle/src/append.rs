//! # Append Log Writer
//!
//! The degenerate materialization policy: every normalized event is stored,
//! stamped with processing time, in arrival order. No keying, no
//! deduplication.

use crate::clock::Clock;
use crate::event::{NormalizedEvent, Row};
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// An immutable appended record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppendRecord {
    /// Arrival number of the source event
    pub arrival: u64,
    /// Wall-clock time of materialization
    pub processed_at: DateTime<Utc>,
    /// Event fields plus the processing-time field
    pub fields: Row,
}

/// Ordered, append-only record sequence.
pub struct AppendLog {
    records: Vec<AppendRecord>,
    clock: Arc<dyn Clock>,
    processing_time_field: String,
    last_processed_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AppendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendLog")
            .field("records", &self.records.len())
            .field("processing_time_field", &self.processing_time_field)
            .finish()
    }
}

impl AppendLog {
    pub fn new(clock: Arc<dyn Clock>, processing_time_field: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            clock,
            processing_time_field: processing_time_field.into(),
            last_processed_at: None,
        }
    }

    /// Append one event. The log grows by exactly one record.
    ///
    /// Processing timestamps never go backwards, even if the wall clock does.
    pub fn append(&mut self, event: NormalizedEvent, arrival: u64) -> &AppendRecord {
        let now = self.clock.now();
        let processed_at = match self.last_processed_at {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_processed_at = Some(processed_at);

        let mut fields = event.fields;
        fields.insert(
            self.processing_time_field.clone(),
            FieldValue::Timestamp(processed_at),
        );

        let index = self.records.len();
        self.records.push(AppendRecord {
            arrival,
            processed_at,
            fields,
        });
        &self.records[index]
    }

    pub fn records(&self) -> &[AppendRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
