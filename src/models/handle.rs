use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Arena address of a fragment set. The generation guards against a handle
/// outliving the set it was issued for once the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetHandle {
    slot: u32,
    generation: u32,
}

impl SetHandle {
    pub fn new(slot: u32, generation: u32) -> Self {
        SetHandle { slot, generation }
    }

    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SetHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "set#{}.{}", self.slot, self.generation)
    }
}

/// Name of one fragment at a storage collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentId {
    pub set: Uuid,
    pub index: u8,
}

impl FragmentId {
    pub fn new(set: Uuid, index: u8) -> Self {
        FragmentId { set, index }
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:03}", self.set.simple(), self.index)
    }
}
