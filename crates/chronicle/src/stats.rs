//! Materialization statistics
//!
//! Lock-free counters shared across shards. Every received event lands in
//! exactly one of the outcome buckets.

use crate::error::MaterializeError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for one pipeline.
#[derive(Debug, Default)]
pub struct MaterializeStats {
    /// Total events received
    pub events_received: AtomicU64,
    /// Events that changed the target
    pub events_applied: AtomicU64,
    /// Type 1 events that were not newer than the current record
    pub discarded_stale: AtomicU64,
    /// Type 2 exact redeliveries
    pub discarded_duplicate: AtomicU64,
    /// Events rejected for an unconvertible field
    pub rejected_malformed: AtomicU64,
    /// Events rejected for lacking a sequence value
    pub rejected_unorderable: AtomicU64,
    /// Events rejected for conflicting with a recorded version
    pub rejected_conflicting: AtomicU64,
    /// Merges aborted by a history invariant violation
    pub failed_invariant: AtomicU64,
    /// Events that failed for configuration or engine errors
    pub failed_other: AtomicU64,
    /// Fields replaced by null under the `null_field` policy
    pub fields_nullified: AtomicU64,
}

impl MaterializeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.discarded_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.discarded_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nullified(&self, fields: usize) {
        self.fields_nullified
            .fetch_add(fields as u64, Ordering::Relaxed);
    }

    /// Count a rejected or failed event under its error kind.
    pub fn record_error(&self, error: &MaterializeError) {
        let counter = match error {
            MaterializeError::MalformedField { .. } => &self.rejected_malformed,
            MaterializeError::UnorderableEvent { .. } => &self.rejected_unorderable,
            MaterializeError::ConflictingEvent { .. } => &self.rejected_conflicting,
            MaterializeError::HistoryInvariant { .. } => &self.failed_invariant,
            MaterializeError::Config(_) | MaterializeError::Runtime(_) => &self.failed_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MaterializeStatsSnapshot {
        MaterializeStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            discarded_stale: self.discarded_stale.load(Ordering::Relaxed),
            discarded_duplicate: self.discarded_duplicate.load(Ordering::Relaxed),
            rejected_malformed: self.rejected_malformed.load(Ordering::Relaxed),
            rejected_unorderable: self.rejected_unorderable.load(Ordering::Relaxed),
            rejected_conflicting: self.rejected_conflicting.load(Ordering::Relaxed),
            failed_invariant: self.failed_invariant.load(Ordering::Relaxed),
            failed_other: self.failed_other.load(Ordering::Relaxed),
            fields_nullified: self.fields_nullified.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of materialization statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeStatsSnapshot {
    pub events_received: u64,
    pub events_applied: u64,
    pub discarded_stale: u64,
    pub discarded_duplicate: u64,
    pub rejected_malformed: u64,
    pub rejected_unorderable: u64,
    pub rejected_conflicting: u64,
    pub failed_invariant: u64,
    pub failed_other: u64,
    pub fields_nullified: u64,
}

impl MaterializeStatsSnapshot {
    pub fn discarded(&self) -> u64 {
        self.discarded_stale + self.discarded_duplicate
    }

    pub fn rejected(&self) -> u64 {
        self.rejected_malformed + self.rejected_unorderable + self.rejected_conflicting
    }

    pub fn failed(&self) -> u64 {
        self.failed_invariant + self.failed_other
    }

    /// Calculate applied rate (0.0 - 1.0).
    pub fn applied_rate(&self) -> f64 {
        if self.events_received == 0 {
            return 1.0;
        }
        self.events_applied as f64 / self.events_received as f64
    }
}
