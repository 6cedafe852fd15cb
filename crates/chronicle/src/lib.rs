//! # chronicle - CDC Materialization Engine
//!
//! Turns a stream of change-data-capture events into append logs, current
//! state tables (SCD Type 1) or bitemporal history tables (SCD Type 2).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       RawEvent                           │
//! └─────────────────────────────┬────────────────────────────┘
//!                               ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ FieldNormalizer   epoch days / epoch micros / binary ids │
//! └─────────────────────────────┬────────────────────────────┘
//!                               ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ SequenceResolver + natural key         exclusion (project)│
//! └───────┬─────────────────────┬───────────────────┬────────┘
//!         ▼                     ▼                   ▼
//!  ┌────────────┐      ┌──────────────────┐  ┌──────────────┐
//!  │ AppendLog  │      │ CurrentStateTable│  │ HistoryTable │
//!  │  (append)  │      │     (type1)      │  │   (type2)    │
//!  └────────────┘      └──────────────────┘  └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use chronicle::{FieldValue, Materializer, MaterializationPolicy, PipelineDescription, RawEvent};
//!
//! let description = PipelineDescription::new("members", MaterializationPolicy::Type1)
//!     .with_natural_key(["member_id"])
//!     .with_sequence_fields(["modified_at", "created_at"])
//!     .with_epoch_micro_fields(["modified_at", "created_at"]);
//!
//! let mut materializer = Materializer::new(description)?;
//! materializer.apply(
//!     RawEvent::new()
//!         .with("member_id", 7)
//!         .with("created_at", 1_700_000_000_000_000i64)
//!         .with("modified_at", FieldValue::Null),
//! );
//! assert_eq!(materializer.current_state().map(|t| t.len()), Some(1));
//! # Ok::<(), chronicle::MaterializeError>(())
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Pipeline description, events, values, the [`Materializer`] and its reports.
//!
//! ### Tier 2: Targets and Engine (crate root)
//! Target tables for direct inspection, the sharded tokio engine, statistics.
//!
//! ### Tier 3: Building Blocks (modules)
//! Normalizer, sequence resolver and router, via their modules.

pub mod append;
pub mod clock;
pub mod config;
pub mod current;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod history;
pub mod normalize;
pub mod parallel;
pub mod partitioner;
pub mod sequence;
pub mod stats;
pub mod value;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use config::{MalformedFieldPolicy, MaterializationPolicy, PipelineDescription};
pub use dispatcher::{
    AppliedChange, DiscardReason, EventOutcome, EventReport, KeyHistorySnapshot, Materializer,
    TargetSnapshot,
};
pub use error::{ErrorCategory, MaterializeError, Result};
pub use event::{NormalizedEvent, RawEvent, Row};
pub use value::{FieldValue, NaturalKey, SequenceValue};

// =============================================================================
// TIER 2: Targets and Engine
// =============================================================================

pub use append::{AppendLog, AppendRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use current::{CurrentRecord, CurrentStateTable};
pub use history::{HistoryTable, HistoryVersion, KeyHistory};
pub use parallel::{ParallelConfig, ReportHandle, ShardedMaterializer};
pub use stats::{MaterializeStats, MaterializeStatsSnapshot};
