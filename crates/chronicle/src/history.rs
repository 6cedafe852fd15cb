//! # Bitemporal History (Type 2) Merger
//!
//! Maintains, per natural key, an ordered set of validity intervals
//! `[start, end)` keyed by start sequence. For every key the intervals are
//! contiguous, non-overlapping, and exactly the last one is open.
//!
//! ```text
//! key 42:  [10 ────── 20) [20 ────── 30) [30 ──────────▶
//!            v1 (closed)    v2 (closed)    v3 (current)
//! ```
//!
//! ## Merge rules
//!
//! An event at sequence `s` finds the interval `I` whose window contains `s`:
//!
//! - **In order** (`I` is the open interval): close `I` at `s`, open a new
//!   interval at `s`.
//! - **Late** (`I` is closed): split `I` at `s`. The earlier piece keeps `I`'s
//!   fields, the new piece covers `[s, I.end)`.
//! - **Before the first interval**: insert `[s, first.start)`.
//! - **Equal to an existing start**: a payload identical to the one delivered
//!   for that version is a redelivery and is discarded; any other payload is
//!   a conflict.
//!
//! With `partial_update`, null fields in the incoming event mean "unchanged"
//! and are filled from `I`. A late arrival only fills its own gap: versions
//! after it were computed from what was known at the time and are not
//! recomputed, so a late partial update never propagates forward.
//!
//! Every merge is planned against the current state first and committed
//! only if the plan is consistent, so a failed merge leaves the key's
//! history untouched.

use crate::error::{MaterializeError, Result};
use crate::event::{NormalizedEvent, Row};
use crate::value::{NaturalKey, SequenceValue};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use tracing::debug;

/// One validity interval of a key's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryVersion {
    /// Inclusive start
    pub start: SequenceValue,
    /// Exclusive end; `None` while this is the current version
    pub end: Option<SequenceValue>,
    /// Arrival number of the event that created this version
    pub arrival: u64,
    pub fields: Row,
    /// Payload as delivered, before partial-update filling
    #[serde(skip)]
    pub delivered: Row,
}

impl HistoryVersion {
    pub fn is_current(&self) -> bool {
        self.end.is_none()
    }

    /// Whether `sequence` falls inside `[start, end)`.
    pub fn contains(&self, sequence: SequenceValue) -> bool {
        self.start <= sequence && self.end.map_or(true, |end| sequence < end)
    }
}

/// The interval set of a single key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyHistory {
    versions: BTreeMap<SequenceValue, HistoryVersion>,
}

impl KeyHistory {
    /// Versions ordered by start sequence.
    pub fn versions(&self) -> impl Iterator<Item = &HistoryVersion> {
        self.versions.values()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The open interval.
    pub fn current(&self) -> Option<&HistoryVersion> {
        self.versions.values().next_back().filter(|v| v.is_current())
    }

    /// The version in effect at `sequence`.
    pub fn as_of(&self, sequence: SequenceValue) -> Option<&HistoryVersion> {
        self.versions
            .range(..=sequence)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.contains(sequence))
    }

    /// Check that intervals are contiguous, non-overlapping and that exactly
    /// the last one is open.
    pub fn verify(&self, key: &NaturalKey) -> Result<()> {
        let mut previous: Option<&HistoryVersion> = None;
        for (start, version) in &self.versions {
            if version.start != *start {
                return Err(MaterializeError::invariant(
                    key,
                    format!("version starting at {} is indexed under {}", version.start, start),
                ));
            }
            if let Some(end) = version.end {
                if end <= version.start {
                    return Err(MaterializeError::invariant(
                        key,
                        format!("empty interval [{}, {})", version.start, end),
                    ));
                }
            }
            if let Some(prev) = previous {
                match prev.end {
                    None => {
                        return Err(MaterializeError::invariant(
                            key,
                            format!("open interval at {} is followed by {}", prev.start, start),
                        ))
                    }
                    Some(end) if end != *start => {
                        return Err(MaterializeError::invariant(
                            key,
                            format!("interval ending at {} is followed by one starting at {}", end, start),
                        ))
                    }
                    Some(_) => {}
                }
            }
            previous = Some(version);
        }
        match previous {
            Some(last) if !last.is_current() => Err(MaterializeError::invariant(
                key,
                format!("latest interval starting at {} is closed", last.start),
            )),
            _ => Ok(()),
        }
    }
}

/// Outcome of a Type 2 merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMerge {
    /// New current version; `closed` is the start of the version it closed
    Appended { closed: Option<SequenceValue> },
    /// Late arrival inserted into the past, covering `[start, until)`;
    /// `split` is the start of the version it was cut out of
    Backfilled {
        split: Option<SequenceValue>,
        until: SequenceValue,
    },
    /// Identical redelivery of an existing version
    Duplicate,
}

/// Edits for one key, computed without mutating anything.
enum MergePlan {
    Duplicate,
    Insert {
        close: Option<SequenceValue>,
        version: HistoryVersion,
    },
}

/// History table: interval sets for every natural key.
#[derive(Debug, Clone, Default)]
pub struct HistoryTable {
    keys: HashMap<NaturalKey, KeyHistory>,
    partial_update: bool,
    sequence_output_name: Option<String>,
}

impl HistoryTable {
    pub fn new(partial_update: bool, sequence_output_name: Option<String>) -> Self {
        Self {
            keys: HashMap::new(),
            partial_update,
            sequence_output_name,
        }
    }

    /// Merge an event for `key` at `sequence`. All-or-nothing per key.
    pub fn merge(
        &mut self,
        key: NaturalKey,
        sequence: SequenceValue,
        event: NormalizedEvent,
        arrival: u64,
    ) -> Result<HistoryMerge> {
        let plan = self.plan(&key, sequence, event, arrival)?;

        let (close, version) = match plan {
            MergePlan::Duplicate => {
                debug!("Discarding redelivered event for key {} at {}", key, sequence);
                return Ok(HistoryMerge::Duplicate);
            }
            MergePlan::Insert { close, version } => (close, version),
        };

        let outcome = match version.end {
            None => HistoryMerge::Appended { closed: close },
            Some(until) => HistoryMerge::Backfilled { split: close, until },
        };
        debug!("History merge for key {} at {}: {:?}", key, sequence, outcome);

        let history = self.keys.entry(key).or_default();
        if let Some(start) = close {
            if let Some(closed) = history.versions.get_mut(&start) {
                closed.end = Some(sequence);
            }
        }
        history.versions.insert(sequence, version);

        Ok(outcome)
    }

    fn plan(
        &self,
        key: &NaturalKey,
        sequence: SequenceValue,
        event: NormalizedEvent,
        arrival: u64,
    ) -> Result<MergePlan> {
        let versions = self.keys.get(key).map(|h| &h.versions);
        let predecessor = versions
            .and_then(|v| v.range(..=sequence).next_back())
            .map(|(_, v)| v);
        let successor = versions
            .and_then(|v| v.range((Excluded(sequence), Unbounded)).next())
            .map(|(start, _)| *start);

        let Some(predecessor) = predecessor else {
            // First event for the key, or earlier than everything recorded
            return Ok(MergePlan::Insert {
                close: None,
                version: HistoryVersion {
                    start: sequence,
                    end: successor,
                    arrival,
                    delivered: event.fields.clone(),
                    fields: self.build_fields(None, event, sequence),
                },
            });
        };

        if predecessor.start == sequence {
            return if event.fields == predecessor.delivered {
                Ok(MergePlan::Duplicate)
            } else {
                Err(MaterializeError::conflicting(key, sequence))
            };
        }

        if predecessor.end != successor {
            return Err(MaterializeError::invariant(
                key,
                format!(
                    "interval starting at {} ends at {} but the next interval starts at {}",
                    predecessor.start,
                    display_bound(predecessor.end),
                    display_bound(successor),
                ),
            ));
        }

        Ok(MergePlan::Insert {
            close: Some(predecessor.start),
            version: HistoryVersion {
                start: sequence,
                end: predecessor.end,
                arrival,
                delivered: event.fields.clone(),
                fields: self.build_fields(Some(&predecessor.fields), event, sequence),
            },
        })
    }

    /// Compute a version's fields. With partial updates, incoming nulls keep
    /// the base value.
    fn build_fields(&self, base: Option<&Row>, event: NormalizedEvent, sequence: SequenceValue) -> Row {
        let mut fields = match base {
            Some(base) if self.partial_update => {
                let mut fields = base.clone();
                for (name, value) in event.fields {
                    if value.is_null() && fields.contains_key(&name) {
                        continue;
                    }
                    fields.insert(name, value);
                }
                fields
            }
            _ => event.fields,
        };
        if let Some(name) = &self.sequence_output_name {
            fields.insert(name.clone(), sequence.to_field_value());
        }
        fields
    }

    pub fn history(&self, key: &NaturalKey) -> Option<&KeyHistory> {
        self.keys.get(key)
    }

    /// Versions of `key` ordered by start; empty for unknown keys.
    pub fn versions(&self, key: &NaturalKey) -> Vec<&HistoryVersion> {
        self.keys
            .get(key)
            .map(|h| h.versions().collect())
            .unwrap_or_default()
    }

    pub fn current(&self, key: &NaturalKey) -> Option<&HistoryVersion> {
        self.keys.get(key).and_then(KeyHistory::current)
    }

    /// Verify one key's interval set.
    pub fn verify(&self, key: &NaturalKey) -> Result<()> {
        self.keys.get(key).map_or(Ok(()), |h| h.verify(key))
    }

    pub fn as_of(&self, key: &NaturalKey, sequence: SequenceValue) -> Option<&HistoryVersion> {
        self.keys.get(key).and_then(|h| h.as_of(sequence))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of versions across all keys.
    pub fn version_count(&self) -> usize {
        self.keys.values().map(KeyHistory::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NaturalKey, &KeyHistory)> {
        self.keys.iter()
    }

    /// Keys with their histories, sorted by natural key.
    pub fn sorted(&self) -> Vec<(&NaturalKey, &KeyHistory)> {
        let mut keys: Vec<_> = self.keys.iter().collect();
        keys.sort_by(|a, b| a.0.cmp(b.0));
        keys
    }

    /// Verify every key's interval set.
    pub fn verify_all(&self) -> Result<()> {
        self.keys
            .iter()
            .try_for_each(|(key, history)| history.verify(key))
    }
}

fn display_bound(bound: Option<SequenceValue>) -> String {
    bound.map_or_else(|| "infinity".to_string(), |s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawEvent;
    use crate::value::FieldValue;

    fn key(id: i64) -> NaturalKey {
        NaturalKey::new(vec![FieldValue::Int(id)])
    }

    fn seq(p: i64) -> SequenceValue {
        SequenceValue::Position(p)
    }

    fn row(pairs: &[(&str, FieldValue)]) -> NormalizedEvent {
        let mut raw = RawEvent::new();
        for (k, v) in pairs {
            raw = raw.with(*k, v.clone());
        }
        NormalizedEvent::new(raw.fields)
    }

    fn named(id: i64, name: &str) -> NormalizedEvent {
        row(&[("id", id.into()), ("name", name.into())])
    }

    fn spans(table: &HistoryTable, k: &NaturalKey) -> Vec<(SequenceValue, Option<SequenceValue>)> {
        table
            .history(k)
            .unwrap()
            .versions()
            .map(|v| (v.start, v.end))
            .collect()
    }

    #[test]
    fn test_first_event_opens_interval() {
        let mut table = HistoryTable::new(false, None);
        let outcome = table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        assert_eq!(outcome, HistoryMerge::Appended { closed: None });
        assert_eq!(spans(&table, &key(1)), vec![(seq(10), None)]);
    }

    #[test]
    fn test_in_order_closes_current() {
        let mut table = HistoryTable::new(false, None);
        table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        let outcome = table.merge(key(1), seq(20), named(1, "b"), 1).unwrap();

        assert_eq!(outcome, HistoryMerge::Appended { closed: Some(seq(10)) });
        assert_eq!(
            spans(&table, &key(1)),
            vec![(seq(10), Some(seq(20))), (seq(20), None)]
        );
        assert_eq!(table.current(&key(1)).unwrap().fields["name"], FieldValue::from("b"));
        table.verify_all().unwrap();
    }

    #[test]
    fn test_late_arrival_splits_interval() {
        let mut table = HistoryTable::new(false, None);
        table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        table.merge(key(1), seq(30), named(1, "c"), 1).unwrap();
        let outcome = table.merge(key(1), seq(20), named(1, "b"), 2).unwrap();

        assert_eq!(
            outcome,
            HistoryMerge::Backfilled {
                split: Some(seq(10)),
                until: seq(30)
            }
        );
        assert_eq!(
            spans(&table, &key(1)),
            vec![
                (seq(10), Some(seq(20))),
                (seq(20), Some(seq(30))),
                (seq(30), None)
            ]
        );
        let names: Vec<_> = table
            .history(&key(1))
            .unwrap()
            .versions()
            .map(|v| v.fields["name"].clone())
            .collect();
        assert_eq!(names, vec![FieldValue::from("a"), FieldValue::from("b"), FieldValue::from("c")]);
        table.verify_all().unwrap();
    }

    #[test]
    fn test_arrival_before_first_interval() {
        let mut table = HistoryTable::new(false, None);
        table.merge(key(1), seq(20), named(1, "b"), 0).unwrap();
        let outcome = table.merge(key(1), seq(5), named(1, "a"), 1).unwrap();

        assert_eq!(
            outcome,
            HistoryMerge::Backfilled {
                split: None,
                until: seq(20)
            }
        );
        assert_eq!(
            spans(&table, &key(1)),
            vec![(seq(5), Some(seq(20))), (seq(20), None)]
        );
        table.verify_all().unwrap();
    }

    #[test]
    fn test_partial_update_preserves_unchanged_fields() {
        let mut table = HistoryTable::new(true, None);
        let full = row(&[
            ("id", 1.into()),
            ("name", "Alice".into()),
            ("email", "a@example.com".into()),
            ("tier", "gold".into()),
            ("city", "Oslo".into()),
        ]);
        let partial = row(&[
            ("id", 1.into()),
            ("name", FieldValue::Null),
            ("email", "alice@example.com".into()),
            ("tier", FieldValue::Null),
            ("city", "Bergen".into()),
        ]);
        table.merge(key(1), seq(1), full, 0).unwrap();
        table.merge(key(1), seq(2), partial, 1).unwrap();

        let history = table.history(&key(1)).unwrap();
        let versions: Vec<_> = history.versions().collect();
        assert_eq!(versions[0].fields["email"], FieldValue::from("a@example.com"));
        assert_eq!(versions[1].fields["name"], FieldValue::from("Alice"));
        assert_eq!(versions[1].fields["tier"], FieldValue::from("gold"));
        assert_eq!(versions[1].fields["email"], FieldValue::from("alice@example.com"));
        assert_eq!(versions[1].fields["city"], FieldValue::from("Bergen"));
    }

    #[test]
    fn test_late_partial_update_does_not_rewrite_downstream_versions() {
        let mut table = HistoryTable::new(true, None);
        table
            .merge(key(1), seq(10), row(&[("id", 1.into()), ("a", "a10".into()), ("b", "b10".into())]), 0)
            .unwrap();
        table
            .merge(key(1), seq(30), row(&[("id", 1.into()), ("a", FieldValue::Null), ("b", "b30".into())]), 1)
            .unwrap();
        // Late change to `a` at 20: fills [20, 30) only
        table
            .merge(key(1), seq(20), row(&[("id", 1.into()), ("a", "a20".into()), ("b", FieldValue::Null)]), 2)
            .unwrap();

        let late = table.as_of(&key(1), seq(25)).unwrap();
        assert_eq!(late.fields["a"], FieldValue::from("a20"));
        assert_eq!(late.fields["b"], FieldValue::from("b10"));

        // The version at 30 was derived from the 10 version and keeps a10
        let current = table.current(&key(1)).unwrap();
        assert_eq!(current.fields["a"], FieldValue::from("a10"));
        assert_eq!(current.fields["b"], FieldValue::from("b30"));
    }

    #[test]
    fn test_exact_redelivery_is_discarded() {
        let mut table = HistoryTable::new(false, Some("_sequence".into()));
        table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        table.merge(key(1), seq(20), named(1, "b"), 1).unwrap();
        let before = table.history(&key(1)).unwrap().clone();

        assert_eq!(
            table.merge(key(1), seq(10), named(1, "a"), 2).unwrap(),
            HistoryMerge::Duplicate
        );
        assert_eq!(table.history(&key(1)).unwrap(), &before);
    }

    #[test]
    fn test_partial_redelivery_is_discarded() {
        let mut table = HistoryTable::new(true, None);
        table.merge(key(1), seq(1), named(1, "a"), 0).unwrap();
        let partial = row(&[("id", 1.into()), ("name", FieldValue::Null), ("email", "x".into())]);
        table.merge(key(1), seq(2), partial.clone(), 1).unwrap();
        assert_eq!(table.merge(key(1), seq(2), partial, 2).unwrap(), HistoryMerge::Duplicate);
    }

    #[test]
    fn test_partial_payload_matching_merged_row_is_conflict() {
        let mut table = HistoryTable::new(true, None);
        table
            .merge(key(1), seq(1), row(&[("name", "Alice".into()), ("city", "Oslo".into())]), 0)
            .unwrap();
        table
            .merge(key(1), seq(2), row(&[("name", FieldValue::Null), ("city", "Bergen".into())]), 1)
            .unwrap();
        let before = table.history(&key(1)).unwrap().clone();

        // Fills in to the stored row, but is not what was delivered at 2
        let err = table
            .merge(key(1), seq(2), row(&[("name", "Alice".into()), ("city", FieldValue::Null)]), 2)
            .unwrap_err();
        assert_eq!(err.error_code(), "conflicting_event");
        assert_eq!(table.history(&key(1)).unwrap(), &before);
    }

    #[test]
    fn test_conflicting_payload_at_same_sequence() {
        let mut table = HistoryTable::new(false, None);
        table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        let before = table.history(&key(1)).unwrap().clone();

        let err = table.merge(key(1), seq(10), named(1, "z"), 1).unwrap_err();
        assert_eq!(err.error_code(), "conflicting_event");
        assert_eq!(table.history(&key(1)).unwrap(), &before);
    }

    #[test]
    fn test_corrupt_history_aborts_merge_without_changes() {
        let mut table = HistoryTable::new(false, None);
        table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        table.merge(key(1), seq(20), named(1, "b"), 1).unwrap();

        // Break the chain: the latest interval is closed
        if let Some(v) = table.keys.get_mut(&key(1)).unwrap().versions.get_mut(&seq(20)) {
            v.end = Some(seq(25));
        }
        let before = table.history(&key(1)).unwrap().clone();

        let err = table.merge(key(1), seq(30), named(1, "c"), 2).unwrap_err();
        assert_eq!(err.error_code(), "history_invariant");
        assert_eq!(table.history(&key(1)).unwrap(), &before);
        assert!(table.verify_all().is_err());
    }

    #[test]
    fn test_verify_detects_gap() {
        let mut table = HistoryTable::new(false, None);
        table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        table.merge(key(1), seq(20), named(1, "b"), 1).unwrap();
        if let Some(v) = table.keys.get_mut(&key(1)).unwrap().versions.get_mut(&seq(10)) {
            v.end = Some(seq(15));
        }
        let err = table.history(&key(1)).unwrap().verify(&key(1)).unwrap_err();
        assert!(err.to_string().contains("15"));
    }

    #[test]
    fn test_as_of_lookup() {
        let mut table = HistoryTable::new(false, None);
        table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        table.merge(key(1), seq(20), named(1, "b"), 1).unwrap();

        assert!(table.as_of(&key(1), seq(9)).is_none());
        assert_eq!(table.as_of(&key(1), seq(10)).unwrap().fields["name"], FieldValue::from("a"));
        assert_eq!(table.as_of(&key(1), seq(19)).unwrap().fields["name"], FieldValue::from("a"));
        assert_eq!(table.as_of(&key(1), seq(1_000)).unwrap().fields["name"], FieldValue::from("b"));
        assert!(table.as_of(&key(2), seq(10)).is_none());
    }

    #[test]
    fn test_keys_are_independent() {
        let mut table = HistoryTable::new(false, None);
        table.merge(key(1), seq(10), named(1, "a"), 0).unwrap();
        table.merge(key(2), seq(5), named(2, "x"), 1).unwrap();
        table.merge(key(1), seq(20), named(1, "b"), 2).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.version_count(), 3);
        assert_eq!(table.versions(&key(1)).len(), 2);
        assert!(table.versions(&key(3)).is_empty());
        assert!(table.verify(&key(3)).is_ok());
        assert_eq!(spans(&table, &key(2)), vec![(seq(5), None)]);
    }
}
