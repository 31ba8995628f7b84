//! Interfaces the engine consumes from the outside world, plus the
//! implementations shipped with the crate.

pub mod directory;
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::{
    errors::Result,
    models::{
        handle::FragmentId,
        key::{FragmentKey, KeyId},
        placement::LocationId,
    },
};

pub use directory::DirectoryStorage;
pub use memory::{MemoryKeyStore, MemoryStorage};

/// Holds sealed fragment bytes at named locations. Retrieval is the only
/// operation expected to block on I/O.
#[async_trait]
pub trait StorageCollaborator: Send + Sync {
    async fn put(
        &self,
        location: &LocationId,
        fragment: &FragmentId,
        sealed: &[u8],
        ttl: Duration,
    ) -> Result<()>;

    /// `Ok(None)` means the location does not hold the fragment.
    async fn get(&self, location: &LocationId, fragment: &FragmentId) -> Result<Option<Vec<u8>>>;

    /// Moves the storage-side expiry of a held fragment to `ttl` from now.
    /// Holding nothing for `fragment` is not an error.
    async fn refresh(
        &self,
        location: &LocationId,
        fragment: &FragmentId,
        ttl: Duration,
    ) -> Result<()>;

    /// Best effort. Success does not prove the bytes are gone from the
    /// underlying media.
    async fn delete(&self, location: &LocationId, fragment: &FragmentId) -> Result<()>;

    /// Estimated round trip between `requester` and `location`, or `None`
    /// when the location is unknown.
    fn latency(&self, requester: &str, location: &LocationId) -> Option<Duration>;
}

/// Owner of fragment keys. Destroying a key is the enforceable deletion
/// boundary.
pub trait KeyStore: Send + Sync {
    fn generate_key(&self, id: &KeyId) -> Result<FragmentKey>;

    fn destroy_key(&self, id: &KeyId) -> Result<()>;
}
