use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    errors::{EngineError, Result},
    models::placement::LocationId,
    placement::PlacementPolicy,
};

/// Engine settings. Fractions are relative to the TTL of the set they are
/// applied to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub max_payload_len: usize,
    /// Payloads shorter than this are zero-padded up to it before encoding.
    pub min_payload_len: usize,
    pub min_threshold: usize,
    /// Share of the original TTL before the deadline during which a set is
    /// expiring and can no longer be extended.
    pub expiring_margin: f64,
    /// Share of the TTL that must remain unused after retrieving a fragment.
    pub latency_reserve: f64,
    /// Fragments held back from the primary tier.
    pub primary_margin: usize,
    /// Destroy a set as soon as one reconstruction succeeds.
    pub destroy_on_read: bool,
    pub requester: String,
    pub locations: Vec<LocationId>,
    /// How long a destroyed set stays addressable before its slot is freed.
    /// `None` keeps it until `purge_destroyed` is called.
    pub purge_after: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_ttl: Duration::from_millis(1),
            max_ttl: Duration::from_secs(10),
            max_payload_len: 10 * 1024 * 1024,
            min_payload_len: 64,
            min_threshold: 2,
            expiring_margin: 0.10,
            latency_reserve: 0.20,
            primary_margin: 1,
            destroy_on_read: false,
            requester: "local".to_string(),
            locations: Vec::new(),
            purge_after: Some(Duration::from_secs(60)),
        }
    }
}

impl EngineConfig {
    pub fn with_locations(mut self, locations: &[&str]) -> Self {
        self.locations = locations.iter().map(|l| LocationId::new(l)).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_ttl.is_zero() || self.min_ttl > self.max_ttl {
            return Err(EngineError::invalid_parameters(
                "TTL bounds must satisfy 0 < min_ttl <= max_ttl",
            ));
        }
        if self.min_payload_len > self.max_payload_len {
            return Err(EngineError::invalid_parameters(
                "min_payload_len exceeds max_payload_len",
            ));
        }
        if self.min_threshold == 0 {
            return Err(EngineError::invalid_parameters("min_threshold must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.expiring_margin) {
            return Err(EngineError::invalid_parameters(
                "expiring_margin must be in [0, 1)",
            ));
        }
        if !(0.0..1.0).contains(&self.latency_reserve) {
            return Err(EngineError::invalid_parameters(
                "latency_reserve must be in [0, 1)",
            ));
        }
        Ok(())
    }

    pub fn placement_policy(&self) -> PlacementPolicy {
        PlacementPolicy {
            latency_reserve: self.latency_reserve,
            primary_margin: self.primary_margin,
        }
    }

    pub fn expiring_margin_for(&self, ttl: Duration) -> Duration {
        scale(ttl, self.expiring_margin)
    }

    pub fn validate_ttl(&self, ttl: Duration) -> Result<()> {
        if ttl < self.min_ttl || ttl > self.max_ttl {
            return Err(EngineError::InvalidTtl {
                requested: ttl,
                min: self.min_ttl,
                max: self.max_ttl,
            });
        }
        Ok(())
    }
}

/// `d * fraction`, rounded to the nearest nanosecond.
pub(crate) fn scale(d: Duration, fraction: f64) -> Duration {
    Duration::from_nanos((d.as_nanos() as f64 * fraction).round() as u64)
}
