//! Latency-constrained placement of fragments onto storage locations.
//!
//! Planning is a pure function of its inputs: candidates are ranked by round
//! trip, locations whose round trip would eat into the reserved share of the
//! TTL are excluded, and the remaining ones are split into a primary tier
//! (the lowest latencies, serving prompt local reconstruction) and a backup
//! tier.

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    config::scale,
    errors::{EngineError, Result},
    models::placement::{Candidate, Placement, PlacementAssignment, Tier},
};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlacementPolicy {
    /// Share of the TTL budget that must remain unused after a retrieval.
    pub latency_reserve: f64,
    /// How many of the `k` lowest-latency slots are left out of the
    /// primary tier.
    pub primary_margin: usize,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        PlacementPolicy {
            latency_reserve: 0.20,
            primary_margin: 1,
        }
    }
}

impl PlacementPolicy {
    pub fn latency_bound(&self, ttl_budget: Duration) -> Duration {
        scale(ttl_budget, 1.0 - self.latency_reserve.clamp(0.0, 1.0))
    }
}

pub fn plan(
    total: usize,
    threshold: usize,
    ttl_budget: Duration,
    candidates: &[Candidate],
    policy: &PlacementPolicy,
) -> Result<PlacementAssignment> {
    if threshold == 0 || threshold > total || total > u8::MAX as usize {
        return Err(EngineError::InvalidParameters(format!(
            "cannot place {} fragments with threshold {}",
            total, threshold
        )));
    }

    let bound = policy.latency_bound(ttl_budget);

    // rank by latency, ties broken by name; a location listed twice keeps
    // its best estimate
    let ranked: Vec<&Candidate> = candidates
        .iter()
        .sorted_by(|a, b| {
            a.latency
                .cmp(&b.latency)
                .then_with(|| a.location.cmp(&b.location))
        })
        .unique_by(|c| c.location.clone())
        .collect();

    let (eligible, excluded): (Vec<&Candidate>, Vec<&Candidate>) =
        ranked.into_iter().partition(|c| c.latency <= bound);
    for c in &excluded {
        debug!(
            "excluding {}: round trip {:?} exceeds bound {:?}",
            c.location, c.latency, bound
        );
    }

    if eligible.len() < threshold {
        return Err(EngineError::UnsatisfiablePlacement {
            eligible: eligible.len(),
            required: threshold,
        });
    }

    let primaries = threshold.saturating_sub(policy.primary_margin).max(1);
    let backups: &[&Candidate] = if eligible.len() > primaries {
        &eligible[primaries..]
    } else {
        &eligible[..]
    };

    let placements: Vec<Placement> = (0..total)
        .map(|i| {
            let (candidate, tier) = if i < primaries {
                (eligible[i], Tier::Primary)
            } else {
                (backups[(i - primaries) % backups.len()], Tier::Backup)
            };
            Placement {
                index: i as u8,
                location: candidate.location.clone(),
                latency: candidate.latency,
                tier,
            }
        })
        .collect();

    let assignment = PlacementAssignment {
        threshold,
        ttl_budget,
        latency_bound: bound,
        placements,
    };

    let reachable = assignment.retrievable_within(bound);
    if reachable < threshold {
        return Err(EngineError::UnsatisfiablePlacement {
            eligible: reachable,
            required: threshold,
        });
    }
    Ok(assignment)
}
