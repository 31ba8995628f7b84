use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use super::handle::SetHandle;

/// Audit entry for one reconstruction attempt. Never mutated once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionRecord {
    pub handle: SetHandle,
    pub set_id: Uuid,
    pub at: SystemTime,
    pub success: bool,
    pub fragments_used: usize,
    pub elapsed: Duration,
    pub failure: Option<String>,
}
