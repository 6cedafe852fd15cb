//! Resolved pipeline description
//!
//! The template collaborator hands the engine one of these per pipeline. It is
//! validated once, up front, so merge code never has to look up field lists
//! dynamically or discover configuration mistakes mid-stream.
//!
//! ```yaml
//! name: claims_history
//! policy: type2
//! natural_key_fields: [claim_id]
//! sequence_fields: [modified_at, created_at]
//! epoch_micro_fields: [modified_at, created_at]
//! epoch_day_fields: [service_date]
//! binary_id_fields: [member_guid]
//! exclude_fields: [_rescued_data]
//! partial_update: true
//! sequence_output_name: _sequence
//! ```

use crate::error::{MaterializeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// How events are materialized into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MaterializationPolicy {
    /// Immutable append log, no keying
    Append,
    /// Current state only (SCD Type 1)
    Type1,
    /// Full validity-interval history (SCD Type 2)
    Type2,
}

impl MaterializationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterializationPolicy::Append => "append",
            MaterializationPolicy::Type1 => "type1",
            MaterializationPolicy::Type2 => "type2",
        }
    }

    /// Whether events must carry a key and a sequence value.
    pub fn is_keyed(&self) -> bool {
        !matches!(self, MaterializationPolicy::Append)
    }
}

impl FromStr for MaterializationPolicy {
    type Err = MaterializeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(MaterializationPolicy::Append),
            "type1" | "scd1" => Ok(MaterializationPolicy::Type1),
            "type2" | "scd2" => Ok(MaterializationPolicy::Type2),
            other => Err(MaterializeError::config(format!(
                "unknown materialization policy '{}' (expected append, type1 or type2)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for MaterializationPolicy {
    type Error = MaterializeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MaterializationPolicy> for String {
    fn from(policy: MaterializationPolicy) -> Self {
        policy.as_str().to_string()
    }
}

impl fmt::Display for MaterializationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a field cannot be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedFieldPolicy {
    /// Reject the whole event
    #[default]
    RejectEvent,
    /// Replace the field with null and keep the event
    NullField,
}

/// A fully resolved pipeline description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDescription {
    /// Pipeline name (used in logs)
    #[serde(default = "default_name")]
    pub name: String,

    /// Materialization policy
    pub policy: MaterializationPolicy,

    /// Natural key fields, in tuple order (type1/type2)
    #[serde(default)]
    pub natural_key_fields: Vec<String>,

    /// Sequence candidates in priority order (type1/type2)
    #[serde(default)]
    pub sequence_fields: Vec<String>,

    /// Fields dropped from the materialized rows
    #[serde(default)]
    pub exclude_fields: BTreeSet<String>,

    /// Integer fields holding days since 1970-01-01
    #[serde(default)]
    pub epoch_day_fields: BTreeSet<String>,

    /// Integer fields holding microseconds since the Unix epoch
    #[serde(default)]
    pub epoch_micro_fields: BTreeSet<String>,

    /// Binary identifier fields rendered as lowercase hex
    #[serde(default)]
    pub binary_id_fields: BTreeSet<String>,

    /// Null fields in an update mean "unchanged" (type2 only)
    #[serde(default)]
    pub partial_update: bool,

    /// Field under which the derived sequence is exposed (type1/type2)
    #[serde(default)]
    pub sequence_output_name: Option<String>,

    /// Handling of unconvertible field values
    #[serde(default)]
    pub malformed_fields: MalformedFieldPolicy,

    /// Field carrying the processing timestamp (append)
    #[serde(default = "default_processing_time_field")]
    pub processing_time_field: String,
}

/// Name given to pipelines that do not set one.
pub const DEFAULT_PIPELINE_NAME: &str = "pipeline";

fn default_name() -> String {
    DEFAULT_PIPELINE_NAME.to_string()
}

fn default_processing_time_field() -> String {
    "_processed_at".to_string()
}

impl PipelineDescription {
    /// Create a description with defaults for everything but the policy.
    pub fn new(name: impl Into<String>, policy: MaterializationPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            natural_key_fields: Vec::new(),
            sequence_fields: Vec::new(),
            exclude_fields: BTreeSet::new(),
            epoch_day_fields: BTreeSet::new(),
            epoch_micro_fields: BTreeSet::new(),
            binary_id_fields: BTreeSet::new(),
            partial_update: false,
            sequence_output_name: None,
            malformed_fields: MalformedFieldPolicy::default(),
            processing_time_field: default_processing_time_field(),
        }
    }

    pub fn with_natural_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.natural_key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sequence_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sequence_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_epoch_day_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.epoch_day_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_epoch_micro_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.epoch_micro_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_binary_id_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.binary_id_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_partial_update(mut self, enabled: bool) -> Self {
        self.partial_update = enabled;
        self
    }

    pub fn with_sequence_output(mut self, name: impl Into<String>) -> Self {
        self.sequence_output_name = Some(name.into());
        self
    }

    pub fn with_malformed_fields(mut self, policy: MalformedFieldPolicy) -> Self {
        self.malformed_fields = policy;
        self
    }

    pub fn with_processing_time_field(mut self, name: impl Into<String>) -> Self {
        self.processing_time_field = name.into();
        self
    }

    /// Partial-update semantics only exist for history targets.
    pub fn effective_partial_update(&self) -> bool {
        self.partial_update && self.policy == MaterializationPolicy::Type2
    }

    /// Validate the description.
    pub fn validate(&self) -> Result<()> {
        if self.policy.is_keyed() {
            if self.natural_key_fields.is_empty() {
                return Err(MaterializeError::config(format!(
                    "pipeline '{}': {} requires at least one natural_key_fields entry",
                    self.name, self.policy
                )));
            }
            if self.sequence_fields.is_empty() {
                return Err(MaterializeError::config(format!(
                    "pipeline '{}': {} requires at least one sequence_fields entry",
                    self.name, self.policy
                )));
            }
            if let Some(dup) = first_duplicate(&self.natural_key_fields) {
                return Err(MaterializeError::config(format!(
                    "pipeline '{}': natural key field '{}' listed twice",
                    self.name, dup
                )));
            }
            if let Some(excluded) = self
                .natural_key_fields
                .iter()
                .find(|f| self.exclude_fields.contains(*f))
            {
                return Err(MaterializeError::config(format!(
                    "pipeline '{}': natural key field '{}' cannot be excluded",
                    self.name, excluded
                )));
            }
            if let Some(output) = &self.sequence_output_name {
                if output.is_empty() || self.natural_key_fields.contains(output) {
                    return Err(MaterializeError::config(format!(
                        "pipeline '{}': invalid sequence_output_name '{}'",
                        self.name, output
                    )));
                }
            }
        }

        let lists = [
            ("epoch_day_fields", &self.epoch_day_fields),
            ("epoch_micro_fields", &self.epoch_micro_fields),
            ("binary_id_fields", &self.binary_id_fields),
        ];
        for (i, (name_a, a)) in lists.iter().enumerate() {
            for (name_b, b) in lists.iter().skip(i + 1) {
                if let Some(field) = a.intersection(b).next() {
                    return Err(MaterializeError::config(format!(
                        "pipeline '{}': field '{}' appears in both {} and {}",
                        self.name, field, name_a, name_b
                    )));
                }
            }
        }

        if self.policy == MaterializationPolicy::Append && self.processing_time_field.is_empty() {
            return Err(MaterializeError::config(format!(
                "pipeline '{}': processing_time_field cannot be empty",
                self.name
            )));
        }

        if self.partial_update && self.policy != MaterializationPolicy::Type2 {
            warn!(
                "Pipeline '{}': partial_update has no effect on {} targets, ignoring",
                self.name, self.policy
            );
        }

        Ok(())
    }
}

fn first_duplicate(fields: &[String]) -> Option<&String> {
    let mut seen = BTreeSet::new();
    fields.iter().find(|f| !seen.insert(f.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scd2() -> PipelineDescription {
        PipelineDescription::new("claims", MaterializationPolicy::Type2)
            .with_natural_key(["claim_id"])
            .with_sequence_fields(["modified_at", "created_at"])
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("append".parse::<MaterializationPolicy>().unwrap(), MaterializationPolicy::Append);
        assert_eq!("SCD2".parse::<MaterializationPolicy>().unwrap(), MaterializationPolicy::Type2);
        let err = "type3".parse::<MaterializationPolicy>().unwrap_err();
        assert_eq!(err.error_code(), "config_error");
        assert!(err.to_string().contains("type3"));
    }

    #[test]
    fn test_valid_description() {
        assert!(scd2().validate().is_ok());
        assert!(PipelineDescription::new("raw", MaterializationPolicy::Append)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_keyed_policy_requires_key_and_sequence() {
        let err = PipelineDescription::new("p", MaterializationPolicy::Type1)
            .with_sequence_fields(["ts"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("natural_key_fields"));

        let err = PipelineDescription::new("p", MaterializationPolicy::Type2)
            .with_natural_key(["id"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("sequence_fields"));
    }

    #[test]
    fn test_excluded_key_rejected() {
        let err = scd2().with_exclude(["claim_id"]).validate().unwrap_err();
        assert!(err.to_string().contains("cannot be excluded"));
    }

    #[test]
    fn test_overlapping_conversion_lists_rejected() {
        let err = scd2()
            .with_epoch_day_fields(["service_date"])
            .with_epoch_micro_fields(["service_date"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("service_date"));
    }

    #[test]
    fn test_sequence_output_cannot_shadow_key() {
        let err = scd2().with_sequence_output("claim_id").validate().unwrap_err();
        assert!(err.to_string().contains("sequence_output_name"));
    }

    #[test]
    fn test_partial_update_only_for_type2() {
        let type1 = PipelineDescription::new("p", MaterializationPolicy::Type1)
            .with_natural_key(["id"])
            .with_sequence_fields(["ts"])
            .with_partial_update(true);
        assert!(type1.validate().is_ok());
        assert!(!type1.effective_partial_update());
        assert!(scd2().with_partial_update(true).effective_partial_update());
    }

    #[test]
    fn test_deserialize_json() {
        let description: PipelineDescription = serde_json::from_str(
            r#"{"policy": "type1", "natural_key_fields": ["id"], "sequence_fields": ["lsn"]}"#,
        )
        .unwrap();
        assert_eq!(description.name, "pipeline");
        assert_eq!(description.policy, MaterializationPolicy::Type1);
        assert_eq!(description.processing_time_field, "_processed_at");
        assert_eq!(description.malformed_fields, MalformedFieldPolicy::RejectEvent);
    }

    #[test]
    fn test_unknown_policy_fails_deserialization() {
        let result: std::result::Result<PipelineDescription, _> =
            serde_json::from_str(r#"{"policy": "merge"}"#);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("unknown materialization policy"));
    }
}
