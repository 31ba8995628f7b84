use async_trait::async_trait;
use log::{debug, info};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;

use super::StorageCollaborator;
use crate::{
    errors::{EngineError, Result},
    models::{handle::FragmentId, placement::LocationId},
};

/// Storage that keeps each location in its own sub-directory of `root`.
/// Fragment TTLs are not enforced here; the engine's key destruction is what
/// makes a lingering file unreadable.
pub struct DirectoryStorage {
    root: PathBuf,
    latencies: HashMap<LocationId, Duration>,
}

impl DirectoryStorage {
    pub fn new(root: &Path) -> Self {
        DirectoryStorage {
            root: root.to_path_buf(),
            latencies: HashMap::new(),
        }
    }

    pub fn with_location(mut self, location: &str, latency: Duration) -> Self {
        self.latencies.insert(LocationId::new(location), latency);
        self
    }

    fn location_dir(&self, location: &LocationId) -> Result<PathBuf> {
        let name = location.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(EngineError::Storage(format!(
                "location {:?} cannot be used as a directory name",
                name
            )));
        }
        Ok(self.root.join(name))
    }

    fn fragment_path(&self, location: &LocationId, fragment: &FragmentId) -> Result<PathBuf> {
        Ok(self
            .location_dir(location)?
            .join(format!("{}.frag", fragment)))
    }
}

#[async_trait]
impl StorageCollaborator for DirectoryStorage {
    async fn put(
        &self,
        location: &LocationId,
        fragment: &FragmentId,
        sealed: &[u8],
        _ttl: Duration,
    ) -> Result<()> {
        fs::create_dir_all(self.location_dir(location)?).await?;
        let out_path = self.fragment_path(location, fragment)?;
        info!("Writing out to {}", out_path.display());
        fs::write(&out_path, sealed).await?;
        Ok(())
    }

    async fn get(&self, location: &LocationId, fragment: &FragmentId) -> Result<Option<Vec<u8>>> {
        let in_path = self.fragment_path(location, fragment)?;
        match fs::read(&in_path).await {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh(
        &self,
        location: &LocationId,
        _fragment: &FragmentId,
        _ttl: Duration,
    ) -> Result<()> {
        // files carry no expiry of their own
        self.location_dir(location).map(|_| ())
    }

    async fn delete(&self, location: &LocationId, fragment: &FragmentId) -> Result<()> {
        let path = self.fragment_path(location, fragment)?;
        let len = match fs::metadata(&path).await {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        // overwrite before unlinking; the filesystem may still keep old blocks
        fs::write(&path, vec![0u8; len]).await?;
        fs::remove_file(&path).await?;
        debug!("removed {}", path.display());
        Ok(())
    }

    fn latency(&self, _requester: &str, location: &LocationId) -> Option<Duration> {
        self.latencies.get(location).copied()
    }
}
