use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: &str) -> Self {
        LocationId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A storage location together with its estimated round trip from the
/// requester.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub location: LocationId,
    pub latency: Duration,
}

impl Candidate {
    pub fn new(location: &str, latency: Duration) -> Self {
        Candidate {
            location: LocationId::new(location),
            latency,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Primary, // lowest-latency locations, used for prompt local reconstruction
    Backup,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub index: u8,
    pub location: LocationId,
    pub latency: Duration,
    pub tier: Tier,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementAssignment {
    pub threshold: usize,
    pub ttl_budget: Duration,
    /// Largest round trip a fragment may need and still leave the reserved
    /// share of the budget unused.
    pub latency_bound: Duration,
    pub placements: Vec<Placement>,
}

impl PlacementAssignment {
    pub fn for_index(&self, index: u8) -> Option<&Placement> {
        self.placements.iter().find(|p| p.index == index)
    }

    /// Number of fragments whose round trip fits inside `budget`.
    pub fn retrievable_within(&self, budget: Duration) -> usize {
        self.placements
            .iter()
            .filter(|p| p.latency <= budget)
            .count()
    }

    pub fn primaries(&self) -> impl Iterator<Item = &Placement> {
        self.placements.iter().filter(|p| p.tier == Tier::Primary)
    }
}
