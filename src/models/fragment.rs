use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    key::{FragmentKey, KeyId},
    placement::LocationId,
};
use crate::crypto;

/// Lifecycle of a single fragment. Ordering follows the forward chain
/// `Created -> Distributed -> Active -> Expiring -> Destroyed`; `Corrupted`
/// sits outside the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FragmentStatus {
    Created,
    Distributed,
    Active,
    Expiring,
    Destroyed,
    Corrupted,
}

impl FragmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FragmentStatus::Destroyed | FragmentStatus::Corrupted)
    }

    /// Whether a reconstruction may read the fragment.
    pub fn is_readable(self) -> bool {
        matches!(self, FragmentStatus::Active | FragmentStatus::Expiring)
    }

    /// Forward steps move exactly one link along the chain. Both terminal
    /// states are reachable from every non-terminal state.
    pub fn can_advance_to(self, next: FragmentStatus) -> bool {
        use FragmentStatus::*;
        match (self, next) {
            (Destroyed, _) | (Corrupted, _) => false,
            (_, Destroyed) | (_, Corrupted) => true,
            (Created, Distributed) | (Distributed, Active) | (Active, Expiring) => true,
            _ => false,
        }
    }
}

/// One sealed fragment as tracked by the lifecycle manager. Only the
/// encrypted form is ever held here.
#[derive(Debug)]
pub struct Fragment {
    pub index: u8,
    pub key_id: KeyId,
    pub checksum: [u8; 32], // BLAKE3 of the sealed bytes
    pub location: LocationId,
    pub latency: Duration,
    key: Option<FragmentKey>,
    sealed: Vec<u8>,
    status: FragmentStatus,
    access_count: u64,
}

impl Fragment {
    pub fn new(
        index: u8,
        key: FragmentKey,
        sealed: Vec<u8>,
        location: LocationId,
        latency: Duration,
    ) -> Self {
        let checksum = *blake3::hash(&sealed).as_bytes();
        Fragment {
            index,
            key_id: key.id.clone(),
            checksum,
            location,
            latency,
            key: Some(key),
            sealed,
            status: FragmentStatus::Created,
            access_count: 0,
        }
    }

    pub fn status(&self) -> FragmentStatus {
        self.status
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn sealed(&self) -> &[u8] {
        &self.sealed
    }

    pub fn key(&self) -> Option<&FragmentKey> {
        self.key.as_ref()
    }

    /// True once key and buffer have been wiped.
    pub fn is_wiped(&self) -> bool {
        self.key.is_none()
    }

    pub fn verify(&self, sealed: &[u8]) -> bool {
        blake3::hash(sealed).as_bytes() == &self.checksum
    }

    /// Applies a transition if the state machine allows it.
    pub fn advance(&mut self, next: FragmentStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn record_access(&mut self) {
        self.access_count += 1;
    }

    /// Local destruction: the key goes first, then the sealed buffer is
    /// overwritten before release. Returns false if already wiped.
    pub fn wipe(&mut self) -> bool {
        let Some(key) = self.key.take() else {
            return false;
        };
        drop(key); // zeroized on drop
        crypto::scrub(&mut self.sealed);
        self.sealed.shrink_to_fit();
        self.advance(FragmentStatus::Destroyed);
        true
    }
}
