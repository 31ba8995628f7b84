use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use super::{fragment::FragmentStatus, handle::SetHandle, placement::LocationId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetState {
    Pending,  // fragments not yet handed to storage
    Active,
    Degraded, // fewer than k fragments remain readable before expiry
    Expiring,
    Destroyed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentSnapshot {
    pub index: u8,
    pub status: FragmentStatus,
    pub location: LocationId,
    pub access_count: u64,
}

/// Read-only view of a fragment set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentSetStatus {
    pub handle: SetHandle,
    pub set_id: Uuid,
    pub total: usize,
    pub threshold: usize,
    pub state: SetState,
    pub created_at: SystemTime,
    pub remaining: Duration,
    pub readable: usize,
    pub fragments: Vec<FragmentSnapshot>,
}

impl FragmentSetStatus {
    pub fn fragment(&self, index: u8) -> Option<&FragmentSnapshot> {
        self.fragments.iter().find(|f| f.index == index)
    }

    pub fn count(&self, status: FragmentStatus) -> usize {
        self.fragments.iter().filter(|f| f.status == status).count()
    }
}
