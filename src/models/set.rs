use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use uuid::Uuid;

use crate::codec::CodecParams;

/// Metadata of one fragmentation: threshold parameters, integrity hash and
/// the expiration contract.
#[derive(Clone, Debug)]
pub struct FragmentSet {
    pub id: Uuid,
    pub params: CodecParams, // identifies the generator matrix
    pub content_hash: [u8; 32],
    pub created_at: SystemTime,
    pub created: Instant,
    pub original_ttl: Duration,
    pub expires_at: Instant,
    pub expiring_at: Instant,
    pub expiring_margin: Duration,
}

impl FragmentSet {
    /// `expiring_margin` is the span before `expires_at` during which the
    /// set counts as expiring and can no longer be extended.
    pub fn new(
        id: Uuid,
        params: CodecParams,
        content_hash: [u8; 32],
        ttl: Duration,
        expiring_margin: Duration,
    ) -> Self {
        let created = Instant::now();
        let expires_at = created + ttl;
        let expiring_margin = expiring_margin.min(ttl);
        FragmentSet {
            id,
            params,
            content_hash,
            created_at: SystemTime::now(),
            created,
            original_ttl: ttl,
            expires_at,
            expiring_at: expires_at - expiring_margin,
            expiring_margin,
        }
    }

    /// Pushes the deadline out by `additional`. The expiring margin stays
    /// tied to the original TTL.
    pub fn extend(&mut self, additional: Duration) {
        self.expires_at += additional;
        self.expiring_at = self.expires_at - self.expiring_margin;
    }

    pub fn total(&self) -> usize {
        self.params.total()
    }

    pub fn threshold(&self) -> usize {
        self.params.threshold()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn is_expiring(&self, now: Instant) -> bool {
        now >= self.expiring_at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
