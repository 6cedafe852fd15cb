//! # Current-State (Type 1) Merger
//!
//! Keeps exactly one live record per natural key. A strictly newer sequence
//! replaces the record wholesale; anything else is a stale discard. Equal
//! sequences are "not newer", which makes exact redelivery a no-op.

use crate::event::{NormalizedEvent, Row};
use crate::value::{NaturalKey, SequenceValue};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// The materialized state of one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentRecord {
    pub key: NaturalKey,
    /// Sequence of the event that produced this state
    pub sequence: SequenceValue,
    /// Arrival number of that event
    pub arrival: u64,
    pub fields: Row,
}

/// Outcome of a Type 1 merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentMerge {
    /// First event for the key
    Inserted,
    /// Newer event replaced the record
    Replaced,
    /// Event was not newer than the governing sequence
    Stale { governing: SequenceValue },
}

/// Current-state table: one record per natural key.
#[derive(Debug, Clone, Default)]
pub struct CurrentStateTable {
    records: HashMap<NaturalKey, CurrentRecord>,
    sequence_output_name: Option<String>,
}

impl CurrentStateTable {
    pub fn new(sequence_output_name: Option<String>) -> Self {
        Self {
            records: HashMap::new(),
            sequence_output_name,
        }
    }

    /// Merge an event for `key` at `sequence`.
    pub fn merge(
        &mut self,
        key: NaturalKey,
        sequence: SequenceValue,
        event: NormalizedEvent,
        arrival: u64,
    ) -> CurrentMerge {
        let outcome = match self.records.get(&key) {
            Some(existing) if sequence <= existing.sequence => {
                debug!(
                    "Discarding stale event for key {} (sequence {} <= {})",
                    key, sequence, existing.sequence
                );
                return CurrentMerge::Stale {
                    governing: existing.sequence,
                };
            }
            Some(_) => CurrentMerge::Replaced,
            None => CurrentMerge::Inserted,
        };

        let mut fields = event.fields;
        if let Some(name) = &self.sequence_output_name {
            fields.insert(name.clone(), sequence.to_field_value());
        }

        self.records.insert(
            key.clone(),
            CurrentRecord {
                key,
                sequence,
                arrival,
                fields,
            },
        );
        outcome
    }

    pub fn get(&self, key: &NaturalKey) -> Option<&CurrentRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CurrentRecord> {
        self.records.values()
    }

    /// Records sorted by natural key.
    pub fn sorted(&self) -> Vec<&CurrentRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}
