//! Error types for materialization
//!
//! Every error is reported per event; none of them is fatal to the engine.
//! Includes error classification for metrics and alerting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input encoding in a single field
    Encoding,
    /// Event cannot be placed in sequence order
    Ordering,
    /// Ambiguous event that needs external reconciliation
    Conflict,
    /// Internal interval-set violation (upstream precondition broken)
    Invariant,
    /// Configuration errors (invalid pipeline description)
    Configuration,
    /// Runtime errors (worker gone, channel closed)
    Runtime,
}

/// Materialization errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MaterializeError {
    /// A raw field could not be converted to its declared semantic type
    #[error("Malformed field '{field}': {value} ({reason})")]
    MalformedField {
        field: String,
        value: String,
        reason: String,
    },

    /// Every sequence candidate was null
    #[error("Unorderable event: all sequence fields are null ({})", candidates.join(", "))]
    UnorderableEvent { candidates: Vec<String> },

    /// Same key and sequence as an existing version, different payload
    #[error("Conflicting event for key {key} at sequence {sequence}: payload differs from recorded version")]
    ConflictingEvent { key: String, sequence: String },

    /// The interval set for a key is (or would become) inconsistent
    #[error("History invariant violated for key {key}: {detail}")]
    HistoryInvariant { key: String, detail: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker or channel failure in the parallel engine
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl MaterializeError {
    /// Create a malformed field error
    pub fn malformed(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedField {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an unorderable event error
    pub fn unorderable(candidates: &[String]) -> Self {
        Self::UnorderableEvent {
            candidates: candidates.to_vec(),
        }
    }

    /// Create a conflicting event error
    pub fn conflicting(key: impl ToString, sequence: impl ToString) -> Self {
        Self::ConflictingEvent {
            key: key.to_string(),
            sequence: sequence.to_string(),
        }
    }

    /// Create a history invariant error
    pub fn invariant(key: impl ToString, detail: impl Into<String>) -> Self {
        Self::HistoryInvariant {
            key: key.to_string(),
            detail: detail.into(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Whether the event was turned away because of its own content.
    ///
    /// Rejections are expected in production streams; everything else means
    /// the engine or its configuration is wrong.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::MalformedField { .. } | Self::UnorderableEvent { .. } | Self::ConflictingEvent { .. }
        )
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedField { .. } => ErrorCategory::Encoding,
            Self::UnorderableEvent { .. } => ErrorCategory::Ordering,
            Self::ConflictingEvent { .. } => ErrorCategory::Conflict,
            Self::HistoryInvariant { .. } => ErrorCategory::Invariant,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Runtime(_) => ErrorCategory::Runtime,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedField { .. } => "malformed_field",
            Self::UnorderableEvent { .. } => "unorderable_event",
            Self::ConflictingEvent { .. } => "conflicting_event",
            Self::HistoryInvariant { .. } => "history_invariant",
            Self::Config(_) => "config_error",
            Self::Runtime(_) => "runtime_error",
        }
    }
}

/// Result type for materialization operations
pub type Result<T> = std::result::Result<T, MaterializeError>;
