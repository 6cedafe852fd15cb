//! # Materialization Dispatcher
//!
//! Wires normalizer, sequence resolver and one target together for a single
//! pipeline and reports what happened to every event.
//!
//! ```text
//! RawEvent ─▶ normalize ─▶ key + sequence ─▶ project ─▶ ┬─ AppendLog
//!                                                       ├─ CurrentStateTable
//!                                                       └─ HistoryTable
//! ```
//!
//! The pipeline description is validated when the [`Materializer`] is
//! created, so configuration mistakes surface before any event is processed.
//!
//! ## Example
//!
//! ```rust
//! use chronicle::{Materializer, MaterializationPolicy, PipelineDescription, RawEvent};
//!
//! let description = PipelineDescription::new("customers", MaterializationPolicy::Type2)
//!     .with_natural_key(["id"])
//!     .with_sequence_fields(["lsn"]);
//! let mut materializer = Materializer::new(description).unwrap();
//!
//! let report = materializer.apply(RawEvent::new().with("id", 1).with("lsn", 10).with("name", "Alice"));
//! assert!(report.outcome.is_applied());
//! ```

use crate::append::{AppendLog, AppendRecord};
use crate::clock::{Clock, SystemClock};
use crate::config::{MaterializationPolicy, PipelineDescription};
use crate::current::{CurrentMerge, CurrentRecord, CurrentStateTable};
use crate::error::{MaterializeError, Result};
use crate::event::RawEvent;
use crate::history::{HistoryMerge, HistoryTable, HistoryVersion};
use crate::normalize::FieldNormalizer;
use crate::sequence::SequenceResolver;
use crate::stats::{MaterializeStats, MaterializeStatsSnapshot};
use crate::value::{NaturalKey, SequenceValue};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Change made to the target by an applied event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedChange {
    /// New record in the append log
    Appended,
    /// First record for a key (Type 1)
    Inserted,
    /// Newer record replaced the current one (Type 1)
    Replaced,
    /// New current version (Type 2)
    HistoryAppended,
    /// Late version inserted into the past (Type 2)
    HistoryBackfilled,
}

impl AppliedChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedChange::Appended => "appended",
            AppliedChange::Inserted => "inserted",
            AppliedChange::Replaced => "replaced",
            AppliedChange::HistoryAppended => "history_appended",
            AppliedChange::HistoryBackfilled => "history_backfilled",
        }
    }
}

/// Why an event left the target untouched without being an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Not newer than the current record (Type 1)
    Stale,
    /// Identical to an existing version (Type 2)
    Duplicate,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::Stale => "stale",
            DiscardReason::Duplicate => "duplicate",
        }
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Applied(AppliedChange),
    Discarded(DiscardReason),
    /// Turned away because of its own content
    Rejected(MaterializeError),
    /// The merge was aborted; the target is unchanged
    Failed(MaterializeError),
}

impl EventOutcome {
    fn from_error(error: MaterializeError) -> Self {
        if error.is_rejection() {
            EventOutcome::Rejected(error)
        } else {
            EventOutcome::Failed(error)
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, EventOutcome::Applied(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            EventOutcome::Applied(_) => "applied",
            EventOutcome::Discarded(_) => "discarded",
            EventOutcome::Rejected(_) => "rejected",
            EventOutcome::Failed(_) => "failed",
        }
    }

    pub fn error(&self) -> Option<&MaterializeError> {
        match self {
            EventOutcome::Rejected(e) | EventOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Per-event outcome record.
#[derive(Debug, Clone, PartialEq)]
pub struct EventReport {
    pub arrival: u64,
    /// Natural key, once extracted (keyed policies)
    pub key: Option<NaturalKey>,
    /// Sequence value, once resolved (keyed policies)
    pub sequence: Option<SequenceValue>,
    pub outcome: EventOutcome,
}

impl Serialize for EventReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            arrival: u64,
            key: Option<&'a NaturalKey>,
            sequence: Option<SequenceValue>,
            status: &'static str,
            reason: Cow<'a, str>,
            code: Option<&'static str>,
        }

        let reason = match &self.outcome {
            EventOutcome::Applied(change) => Cow::Borrowed(change.as_str()),
            EventOutcome::Discarded(reason) => Cow::Borrowed(reason.as_str()),
            EventOutcome::Rejected(e) | EventOutcome::Failed(e) => Cow::Owned(e.to_string()),
        };

        Wire {
            arrival: self.arrival,
            key: self.key.as_ref(),
            sequence: self.sequence,
            status: self.outcome.status(),
            reason,
            code: self.outcome.error().map(MaterializeError::error_code),
        }
        .serialize(serializer)
    }
}

/// Interval set of one key, for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyHistorySnapshot {
    pub key: NaturalKey,
    pub versions: Vec<HistoryVersion>,
}

/// Exported target contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TargetSnapshot {
    /// Records in arrival order
    Append { records: Vec<AppendRecord> },
    /// One record per key, sorted by key
    Type1 { records: Vec<CurrentRecord> },
    /// Interval sets sorted by key
    Type2 { keys: Vec<KeyHistorySnapshot> },
}

impl TargetSnapshot {
    /// Combine snapshots of disjoint key spaces into one.
    pub fn merge(policy: MaterializationPolicy, parts: impl IntoIterator<Item = TargetSnapshot>) -> Self {
        let mut merged = TargetSnapshot::empty(policy);
        for part in parts {
            match (&mut merged, part) {
                (TargetSnapshot::Append { records }, TargetSnapshot::Append { records: more }) => {
                    records.extend(more)
                }
                (TargetSnapshot::Type1 { records }, TargetSnapshot::Type1 { records: more }) => {
                    records.extend(more)
                }
                (TargetSnapshot::Type2 { keys }, TargetSnapshot::Type2 { keys: more }) => keys.extend(more),
                (_, other) => warn!("Ignoring {} snapshot while merging {} snapshots", other.policy(), policy),
            }
        }
        match &mut merged {
            TargetSnapshot::Append { records } => records.sort_by_key(|r| r.arrival),
            TargetSnapshot::Type1 { records } => records.sort_by(|a, b| a.key.cmp(&b.key)),
            TargetSnapshot::Type2 { keys } => keys.sort_by(|a, b| a.key.cmp(&b.key)),
        }
        merged
    }

    fn empty(policy: MaterializationPolicy) -> Self {
        match policy {
            MaterializationPolicy::Append => TargetSnapshot::Append { records: Vec::new() },
            MaterializationPolicy::Type1 => TargetSnapshot::Type1 { records: Vec::new() },
            MaterializationPolicy::Type2 => TargetSnapshot::Type2 { keys: Vec::new() },
        }
    }

    pub fn policy(&self) -> MaterializationPolicy {
        match self {
            TargetSnapshot::Append { .. } => MaterializationPolicy::Append,
            TargetSnapshot::Type1 { .. } => MaterializationPolicy::Type1,
            TargetSnapshot::Type2 { .. } => MaterializationPolicy::Type2,
        }
    }

    /// Number of stored rows (versions, for Type 2).
    pub fn row_count(&self) -> usize {
        match self {
            TargetSnapshot::Append { records } => records.len(),
            TargetSnapshot::Type1 { records } => records.len(),
            TargetSnapshot::Type2 { keys } => keys.iter().map(|k| k.versions.len()).sum(),
        }
    }
}

enum Target {
    Append(AppendLog),
    Current(CurrentStateTable),
    History(HistoryTable),
}

/// Single-threaded materializer for one pipeline.
pub struct Materializer {
    description: PipelineDescription,
    normalizer: FieldNormalizer,
    resolver: SequenceResolver,
    target: Target,
    stats: Arc<MaterializeStats>,
    next_arrival: u64,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("pipeline", &self.description.name)
            .field("policy", &self.description.policy)
            .field("next_arrival", &self.next_arrival)
            .finish()
    }
}

impl Materializer {
    /// Create a materializer using the system clock.
    pub fn new(description: PipelineDescription) -> Result<Self> {
        Self::with_clock(description, Arc::new(SystemClock))
    }

    /// Create a materializer with an explicit processing-time source.
    pub fn with_clock(description: PipelineDescription, clock: Arc<dyn Clock>) -> Result<Self> {
        description.validate()?;

        let target = match description.policy {
            MaterializationPolicy::Append => Target::Append(AppendLog::new(
                clock,
                description.processing_time_field.clone(),
            )),
            MaterializationPolicy::Type1 => Target::Current(CurrentStateTable::new(
                description.sequence_output_name.clone(),
            )),
            MaterializationPolicy::Type2 => Target::History(HistoryTable::new(
                description.effective_partial_update(),
                description.sequence_output_name.clone(),
            )),
        };

        info!(
            "Created {} materializer for pipeline '{}'",
            description.policy, description.name
        );

        Ok(Self {
            normalizer: FieldNormalizer::new(&description),
            resolver: SequenceResolver::new(description.sequence_fields.iter().cloned()),
            target,
            stats: Arc::new(MaterializeStats::new()),
            next_arrival: 0,
            description,
        })
    }

    /// Share a statistics sink (e.g. across shards).
    pub fn with_stats(mut self, stats: Arc<MaterializeStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn description(&self) -> &PipelineDescription {
        &self.description
    }

    /// Apply one event, numbering it in arrival order.
    pub fn apply(&mut self, raw: RawEvent) -> EventReport {
        let arrival = self.next_arrival;
        self.apply_with_arrival(raw, arrival)
    }

    /// Apply one event that was already numbered by the caller.
    pub fn apply_with_arrival(&mut self, raw: RawEvent, arrival: u64) -> EventReport {
        self.next_arrival = self.next_arrival.max(arrival.saturating_add(1));
        self.stats.record_received();

        let mut key = None;
        let mut sequence = None;
        let outcome = match self.materialize(raw, arrival, &mut key, &mut sequence) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.record_error(&e);
                if e.is_rejection() {
                    warn!(
                        "Pipeline '{}': rejected event #{}: {}",
                        self.description.name, arrival, e
                    );
                } else {
                    error!(
                        "Pipeline '{}': event #{} failed, target left unchanged: {}",
                        self.description.name, arrival, e
                    );
                }
                EventOutcome::from_error(e)
            }
        };

        match &outcome {
            EventOutcome::Applied(_) => self.stats.record_applied(),
            EventOutcome::Discarded(DiscardReason::Stale) => self.stats.record_stale(),
            EventOutcome::Discarded(DiscardReason::Duplicate) => self.stats.record_duplicate(),
            EventOutcome::Rejected(_) | EventOutcome::Failed(_) => {}
        }
        EventReport {
            arrival,
            key,
            sequence,
            outcome,
        }
    }

    /// Apply events in order.
    pub fn apply_all(&mut self, events: impl IntoIterator<Item = RawEvent>) -> Vec<EventReport> {
        events.into_iter().map(|raw| self.apply(raw)).collect()
    }

    fn materialize(
        &mut self,
        raw: RawEvent,
        arrival: u64,
        key_out: &mut Option<NaturalKey>,
        sequence_out: &mut Option<SequenceValue>,
    ) -> Result<EventOutcome> {
        let converted = self.normalizer.convert(raw)?;
        if !converted.nullified.is_empty() {
            self.stats.record_nullified(converted.nullified.len());
        }

        if let Target::Append(log) = &mut self.target {
            log.append(self.normalizer.project(converted), arrival);
            return Ok(EventOutcome::Applied(AppliedChange::Appended));
        }

        let key = converted.natural_key(&self.description.natural_key_fields);
        *key_out = Some(key.clone());
        let sequence = self.resolver.resolve(&converted)?;
        *sequence_out = Some(sequence);
        let event = self.normalizer.project(converted);

        let outcome = match &mut self.target {
            Target::Current(table) => match table.merge(key, sequence, event, arrival) {
                CurrentMerge::Inserted => EventOutcome::Applied(AppliedChange::Inserted),
                CurrentMerge::Replaced => EventOutcome::Applied(AppliedChange::Replaced),
                CurrentMerge::Stale { .. } => EventOutcome::Discarded(DiscardReason::Stale),
            },
            Target::History(table) => match table.merge(key, sequence, event, arrival)? {
                HistoryMerge::Appended { .. } => EventOutcome::Applied(AppliedChange::HistoryAppended),
                HistoryMerge::Backfilled { .. } => {
                    EventOutcome::Applied(AppliedChange::HistoryBackfilled)
                }
                HistoryMerge::Duplicate => EventOutcome::Discarded(DiscardReason::Duplicate),
            },
            Target::Append(_) => {
                return Err(MaterializeError::runtime("append target reached keyed merge"))
            }
        };
        debug!(
            "Pipeline '{}': event #{} {}",
            self.description.name,
            arrival,
            outcome.status()
        );
        Ok(outcome)
    }

    pub fn stats(&self) -> MaterializeStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn append_log(&self) -> Option<&AppendLog> {
        match &self.target {
            Target::Append(log) => Some(log),
            _ => None,
        }
    }

    pub fn current_state(&self) -> Option<&CurrentStateTable> {
        match &self.target {
            Target::Current(table) => Some(table),
            _ => None,
        }
    }

    pub fn history(&self) -> Option<&HistoryTable> {
        match &self.target {
            Target::History(table) => Some(table),
            _ => None,
        }
    }

    /// Export the target contents.
    pub fn snapshot(&self) -> TargetSnapshot {
        match &self.target {
            Target::Append(log) => TargetSnapshot::Append {
                records: log.records().to_vec(),
            },
            Target::Current(table) => TargetSnapshot::Type1 {
                records: table.sorted().into_iter().cloned().collect(),
            },
            Target::History(table) => TargetSnapshot::Type2 {
                keys: table
                    .sorted()
                    .into_iter()
                    .map(|(key, history)| KeyHistorySnapshot {
                        key: key.clone(),
                        versions: history.versions().cloned().collect(),
                    })
                    .collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MalformedFieldPolicy;
    use crate::value::FieldValue;
    use chrono::DateTime;

    fn type1() -> PipelineDescription {
        PipelineDescription::new("accounts", MaterializationPolicy::Type1)
            .with_natural_key(["id"])
            .with_sequence_fields(["lsn"])
    }

    fn event(id: i64, lsn: Option<i64>, name: &str) -> RawEvent {
        RawEvent::new().with("id", id).with("lsn", lsn).with("name", name)
    }

    #[test]
    fn test_invalid_description_fails_before_events() {
        let err = Materializer::new(
            PipelineDescription::new("p", MaterializationPolicy::Type2).with_natural_key(["id"]),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "config_error");
    }

    #[test]
    fn test_type1_outcomes() {
        let mut m = Materializer::new(type1()).unwrap();
        let reports = m.apply_all([
            event(1, Some(10), "a"),
            event(1, Some(20), "b"),
            event(1, Some(15), "late"),
            event(1, None, "unordered"),
        ]);

        let outcomes: Vec<_> = reports.iter().map(|r| r.outcome.clone()).collect();
        assert_eq!(outcomes[0], EventOutcome::Applied(AppliedChange::Inserted));
        assert_eq!(outcomes[1], EventOutcome::Applied(AppliedChange::Replaced));
        assert_eq!(outcomes[2], EventOutcome::Discarded(DiscardReason::Stale));
        assert!(matches!(
            outcomes[3],
            EventOutcome::Rejected(MaterializeError::UnorderableEvent { .. })
        ));
        assert_eq!(reports[3].key, Some(NaturalKey::new(vec![FieldValue::Int(1)])));
        assert_eq!(reports[3].sequence, None);
        assert_eq!(reports.iter().map(|r| r.arrival).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        let stats = m.stats();
        assert_eq!(stats.events_received, 4);
        assert_eq!(stats.events_applied, 2);
        assert_eq!(stats.discarded_stale, 1);
        assert_eq!(stats.rejected_unorderable, 1);
    }

    #[test]
    fn test_last_arrival_number_does_not_overflow() {
        let mut m = Materializer::new(type1()).unwrap();
        let report = m.apply_with_arrival(event(1, Some(1), "a"), u64::MAX);
        assert_eq!(report.arrival, u64::MAX);
        assert!(report.outcome.is_applied());

        let report = m.apply(event(2, Some(1), "b"));
        assert_eq!(report.arrival, u64::MAX);
    }

    #[test]
    fn test_sequence_fields_can_be_excluded() {
        let mut m = Materializer::new(type1().with_exclude(["lsn"])).unwrap();
        m.apply(event(1, Some(10), "a"));
        let record = m.current_state().unwrap().iter().next().unwrap();
        assert_eq!(record.sequence, SequenceValue::Position(10));
        assert!(!record.fields.contains_key("lsn"));
    }

    #[test]
    fn test_null_field_policy_counts_nullified() {
        let description = type1()
            .with_epoch_day_fields(["opened"])
            .with_malformed_fields(MalformedFieldPolicy::NullField);
        let mut m = Materializer::new(description).unwrap();
        let report = m.apply(event(1, Some(1), "a").with("opened", "soon"));
        assert!(report.outcome.is_applied());
        assert_eq!(m.stats().fields_nullified, 1);
    }

    #[test]
    fn test_append_snapshot() {
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(0, 0).unwrap()));
        let mut m = Materializer::with_clock(
            PipelineDescription::new("raw", MaterializationPolicy::Append),
            clock,
        )
        .unwrap();
        m.apply(event(1, None, "a"));
        m.apply(event(1, None, "a"));

        let snapshot = m.snapshot();
        assert_eq!(snapshot.policy(), MaterializationPolicy::Append);
        assert_eq!(snapshot.row_count(), 2);
        assert!(m.current_state().is_none());
    }

    #[test]
    fn test_report_serialization() {
        let mut m = Materializer::new(type1()).unwrap();
        let applied = serde_json::to_value(m.apply(event(7, Some(3), "x"))).unwrap();
        assert_eq!(
            applied,
            serde_json::json!({
                "arrival": 0,
                "key": [7],
                "sequence": 3,
                "status": "applied",
                "reason": "inserted",
                "code": null
            })
        );

        let rejected = serde_json::to_value(m.apply(event(7, None, "x"))).unwrap();
        assert_eq!(rejected["status"], "rejected");
        assert_eq!(rejected["code"], "unorderable_event");
        assert_eq!(rejected["sequence"], serde_json::Value::Null);
    }

    #[test]
    fn test_snapshot_merge_sorts_by_key() {
        let mut left = Materializer::new(type1()).unwrap();
        let mut right = Materializer::new(type1()).unwrap();
        left.apply(event(2, Some(1), "b"));
        right.apply(event(1, Some(1), "a"));

        let merged = TargetSnapshot::merge(
            MaterializationPolicy::Type1,
            [left.snapshot(), right.snapshot()],
        );
        match merged {
            TargetSnapshot::Type1 { records } => {
                let ids: Vec<_> = records.iter().map(|r| r.fields["id"].clone()).collect();
                assert_eq!(ids, vec![FieldValue::Int(1), FieldValue::Int(2)]);
            }
            other => panic!("unexpected snapshot: {other:?}"),
        }
    }
}
