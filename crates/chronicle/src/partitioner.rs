//! # Key Routing
//!
//! Assigns every event to the shard that owns its natural key. Events for
//! one key always land on the same shard, which is what keeps merges for a
//! key strictly sequential.
//!
//! The route is computed from the key values as the materializer will see
//! them, after field conversion, so every encoding of a key (bytes, base64
//! text, epoch day or date) lands on the same shard.

use crate::config::PipelineDescription;
use crate::event::RawEvent;
use crate::normalize::FieldNormalizer;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Maps events to shard indices.
#[derive(Debug, Clone)]
pub struct KeyRouter {
    num_shards: u32,
    key_fields: Vec<String>,
    normalizer: FieldNormalizer,
    keyed: bool,
}

impl KeyRouter {
    /// Create a router for a pipeline. Append pipelines route everything to
    /// shard 0 so the log keeps a single total order.
    pub fn new(description: &PipelineDescription, num_shards: u32) -> Self {
        Self {
            num_shards: num_shards.max(1),
            key_fields: description.natural_key_fields.clone(),
            normalizer: FieldNormalizer::new(description),
            keyed: description.policy.is_keyed(),
        }
    }

    /// Get the shard for an event.
    pub fn route(&self, event: &RawEvent) -> u32 {
        if !self.keyed || self.num_shards == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        for field in &self.key_fields {
            self.normalizer
                .converted_value(field, event.get(field))
                .hash(&mut hasher);
        }
        murmur3_finalize(hasher.finish()) % self.num_shards
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }
}

/// Murmur3 finalization for better distribution.
fn murmur3_finalize(mut h: u64) -> u32 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaterializationPolicy;
    use crate::value::FieldValue;
    use chrono::NaiveDate;

    fn keyed() -> PipelineDescription {
        PipelineDescription::new("p", MaterializationPolicy::Type1)
            .with_natural_key(["tenant", "id"])
            .with_sequence_fields(["lsn"])
    }

    #[test]
    fn test_same_key_same_shard() {
        let router = KeyRouter::new(&keyed(), 8);
        let a = RawEvent::new().with("tenant", "acme").with("id", 1).with("lsn", 1);
        let b = RawEvent::new().with("tenant", "acme").with("id", 1).with("lsn", 99).with("x", true);
        assert_eq!(router.route(&a), router.route(&b));
    }

    #[test]
    fn test_converted_key_encodings_same_shard() {
        let description = PipelineDescription::new("p", MaterializationPolicy::Type1)
            .with_natural_key(["guid", "opened"])
            .with_sequence_fields(["lsn"])
            .with_binary_id_fields(["guid"])
            .with_epoch_day_fields(["opened"]);
        let router = KeyRouter::new(&description, 16);

        let expected = router.route(
            &RawEvent::new()
                .with("guid", vec![0xde_u8, 0x00])
                .with("opened", 19737),
        );
        let encodings = [
            RawEvent::new().with("guid", "3gA=").with("opened", "19737"),
            RawEvent::new()
                .with("guid", FieldValue::Json(serde_json::json!([222, 0])))
                .with("opened", NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
        ];
        for event in &encodings {
            assert_eq!(router.route(event), expected);
        }
    }

    #[test]
    fn test_missing_key_field_routes_like_null() {
        let router = KeyRouter::new(&keyed(), 8);
        let missing = RawEvent::new().with("tenant", "acme");
        let null = RawEvent::new().with("tenant", "acme").with("id", FieldValue::Null);
        assert_eq!(router.route(&missing), router.route(&null));
    }

    #[test]
    fn test_distribution() {
        let router = KeyRouter::new(&keyed(), 4);
        let mut counts = [0u32; 4];
        for id in 0..1000 {
            let event = RawEvent::new().with("tenant", "acme").with("id", id);
            counts[router.route(&event) as usize] += 1;
        }
        assert!(counts.iter().all(|&c| c > 150), "uneven distribution: {counts:?}");
    }

    #[test]
    fn test_append_uses_single_shard() {
        let description = PipelineDescription::new("raw", MaterializationPolicy::Append)
            .with_natural_key(["id"]);
        let router = KeyRouter::new(&description, 8);
        for id in 0..50 {
            assert_eq!(router.route(&RawEvent::new().with("id", id)), 0);
        }
    }

    #[test]
    fn test_zero_shards_clamped() {
        let router = KeyRouter::new(&keyed(), 0);
        assert_eq!(router.num_shards(), 1);
    }
}
