use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use log::debug;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

use super::{KeyStore, StorageCollaborator};
use crate::{
    crypto,
    errors::{EngineError, Result},
    models::{
        handle::FragmentId,
        key::{FragmentKey, KeyId},
        placement::LocationId,
    },
};

struct StoredBlob {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-process storage spread over named locations. Retrievals can be made
/// to sleep for the location's latency, and locations can be taken offline.
#[derive(Default)]
pub struct MemoryStorage {
    latencies: HashMap<LocationId, Duration>,
    simulate_latency: bool,
    blobs: DashMap<(LocationId, FragmentId), StoredBlob>,
    offline: DashSet<LocationId>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    pub fn with_location(mut self, location: &str, latency: Duration) -> Self {
        self.latencies.insert(LocationId::new(location), latency);
        self
    }

    /// Makes every `get` wait for the location's round trip.
    pub fn simulating_latency(mut self) -> Self {
        self.simulate_latency = true;
        self
    }

    pub fn locations(&self) -> Vec<LocationId> {
        let mut ids: Vec<LocationId> = self.latencies.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn set_offline(&self, location: &str, offline: bool) {
        let id = LocationId::new(location);
        if offline {
            self.offline.insert(id);
        } else {
            self.offline.remove(&id);
        }
    }

    pub fn contains(&self, location: &LocationId, fragment: &FragmentId) -> bool {
        self.blobs.contains_key(&(location.clone(), *fragment))
    }

    /// Number of blobs held across all locations.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Flips one bit of a stored blob. Returns false if nothing is stored.
    pub fn tamper(&self, location: &LocationId, fragment: &FragmentId) -> bool {
        match self.blobs.get_mut(&(location.clone(), *fragment)) {
            Some(mut blob) if !blob.bytes.is_empty() => {
                let last = blob.bytes.len() - 1;
                blob.bytes[last] ^= 0x01;
                true
            }
            _ => false,
        }
    }

    /// Drops a blob without going through `delete`.
    pub fn lose(&self, location: &LocationId, fragment: &FragmentId) -> bool {
        self.blobs.remove(&(location.clone(), *fragment)).is_some()
    }

    fn ensure_online(&self, location: &LocationId) -> Result<()> {
        if self.offline.contains(location) {
            return Err(EngineError::Storage(format!("{} is unreachable", location)));
        }
        if !self.latencies.contains_key(location) {
            return Err(EngineError::Storage(format!("{} is not a known location", location)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageCollaborator for MemoryStorage {
    async fn put(
        &self,
        location: &LocationId,
        fragment: &FragmentId,
        sealed: &[u8],
        ttl: Duration,
    ) -> Result<()> {
        self.ensure_online(location)?;
        self.blobs.insert(
            (location.clone(), *fragment),
            StoredBlob {
                bytes: sealed.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, location: &LocationId, fragment: &FragmentId) -> Result<Option<Vec<u8>>> {
        self.ensure_online(location)?;
        if self.simulate_latency {
            if let Some(latency) = self.latencies.get(location) {
                tokio::time::sleep(*latency).await;
            }
        }

        let key = (location.clone(), *fragment);
        match self.blobs.get(&key) {
            None => return Ok(None),
            Some(blob) if blob.expires_at > Instant::now() => return Ok(Some(blob.bytes.clone())),
            Some(_) => {}
        }
        debug!("{} at {} outlived its storage TTL", fragment, location);
        if let Some((_, mut blob)) = self.blobs.remove(&key) {
            crypto::scrub(&mut blob.bytes);
        }
        Ok(None)
    }

    async fn refresh(
        &self,
        location: &LocationId,
        fragment: &FragmentId,
        ttl: Duration,
    ) -> Result<()> {
        self.ensure_online(location)?;
        if let Some(mut blob) = self.blobs.get_mut(&(location.clone(), *fragment)) {
            blob.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn delete(&self, location: &LocationId, fragment: &FragmentId) -> Result<()> {
        self.ensure_online(location)?;
        if let Some((_, mut blob)) = self.blobs.remove(&(location.clone(), *fragment)) {
            crypto::scrub(&mut blob.bytes);
        }
        Ok(())
    }

    fn latency(&self, _requester: &str, location: &LocationId) -> Option<Duration> {
        self.latencies.get(location).copied()
    }
}

/// Key store that keeps key material in process memory.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: DashMap<KeyId, FragmentKey>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        MemoryKeyStore::default()
    }

    pub fn contains(&self, id: &KeyId) -> bool {
        self.keys.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    fn generate_key(&self, id: &KeyId) -> Result<FragmentKey> {
        let key = FragmentKey::new(id.clone(), crypto::generate_key_material());
        if self.keys.insert(id.clone(), key.clone()).is_some() {
            return Err(EngineError::InvalidParameters(format!(
                "key {} already exists",
                id
            )));
        }
        Ok(key)
    }

    fn destroy_key(&self, id: &KeyId) -> Result<()> {
        // dropping the removed key zeroizes it
        self.keys.remove(id);
        Ok(())
    }
}
