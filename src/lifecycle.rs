//! Expiration contracts and secure destruction of fragment sets.
//!
//! The manager is the sole owner of every [`FragmentSet`]. Sets live in an
//! arena of generation-checked slots and are addressed by [`SetHandle`]. Each
//! set gets one timer task that marks its fragments expiring and destroys
//! them at the deadline, whether or not anyone ever reconstructed.
//!
//! Lock order: arena slots, then set deadlines, then a fragment. Nothing
//! takes the set lock while holding a fragment lock, and no lock is held
//! across an `.await`.

use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use uuid::Uuid;

use crate::{
    codec::CodecParams,
    collaborators::{KeyStore, StorageCollaborator},
    config::EngineConfig,
    crypto,
    errors::{EngineError, Result},
    models::{
        envelope::FragmentBody,
        fragment::{Fragment, FragmentStatus},
        handle::{FragmentId, SetHandle},
        placement::LocationId,
        set::FragmentSet,
        status::{FragmentSetStatus, FragmentSnapshot, SetState},
    },
};

/// A fragment that may be read, with the location it was placed at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadableFragment {
    pub index: u8,
    pub location: LocationId,
    pub latency: Duration,
}

pub struct SetEntry {
    handle: SetHandle,
    id: Uuid,
    params: CodecParams,
    set: RwLock<FragmentSet>,
    fragments: Vec<Mutex<Fragment>>,
    rescheduled: Notify,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SetEntry {
    pub fn handle(&self) -> SetHandle {
        self.handle
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn params(&self) -> CodecParams {
        self.params
    }

    pub fn snapshot(&self) -> FragmentSet {
        self.set.read().clone()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.set.read().is_expired(now)
    }

    fn deadlines(&self) -> (Instant, Instant) {
        let set = self.set.read();
        (set.expiring_at, set.expires_at)
    }

    fn fragment_id(&self, index: u8) -> FragmentId {
        FragmentId::new(self.id, index)
    }

    /// Readable fragments, lowest latency first.
    pub fn readable_by_latency(&self) -> Vec<ReadableFragment> {
        let mut readable: Vec<ReadableFragment> = self
            .fragments
            .iter()
            .filter_map(|slot| {
                let frag = slot.lock();
                frag.status().is_readable().then(|| ReadableFragment {
                    index: frag.index,
                    location: frag.location.clone(),
                    latency: frag.latency,
                })
            })
            .collect();
        readable.sort_by_key(|f| (f.latency, f.index));
        readable
    }

    fn all_terminal(&self) -> bool {
        self.fragments
            .iter()
            .all(|slot| slot.lock().status().is_terminal())
    }

    fn all_wiped(&self) -> bool {
        self.fragments.iter().all(|slot| slot.lock().is_wiped())
    }

    /// Moves active fragments to `Expiring` once the set is inside its
    /// expiring margin. The set lock is held so an extension cannot
    /// interleave.
    fn mark_expiring(&self, now: Instant) -> bool {
        let set = self.set.read();
        if !set.is_expiring(now) {
            return false;
        }
        for slot in &self.fragments {
            slot.lock().advance(FragmentStatus::Expiring);
        }
        true
    }
}

struct Slot {
    generation: u32,
    entry: Option<Arc<SetEntry>>,
}

struct Shared {
    config: EngineConfig,
    slots: RwLock<Vec<Slot>>,
    storage: Arc<dyn StorageCollaborator>,
    keys: Arc<dyn KeyStore>,
    cache: DashMap<FragmentId, Vec<u8>>, // verified sealed bytes from earlier retrievals
}

#[derive(Clone)]
pub struct LifecycleManager {
    shared: Arc<Shared>,
}

impl LifecycleManager {
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn StorageCollaborator>,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        LifecycleManager {
            shared: Arc::new(Shared {
                config,
                slots: RwLock::new(Vec::new()),
                storage,
                keys,
                cache: DashMap::new(),
            }),
        }
    }

    /// Stamps `expires_at = now + ttl` and arms the destruction timer. Must
    /// be called from within a tokio runtime.
    pub fn create_expiring_set(
        &self,
        id: Uuid,
        params: CodecParams,
        content_hash: [u8; 32],
        fragments: Vec<Fragment>,
        ttl: Duration,
    ) -> Result<SetHandle> {
        let shape_ok = fragments.len() == params.total()
            && fragments
                .iter()
                .enumerate()
                .all(|(i, f)| f.index as usize == i);
        let checked = if shape_ok {
            self.shared.config.validate_ttl(ttl)
        } else {
            Err(EngineError::InvalidParameters(format!(
                "expected fragments 0..{} in order",
                params.total()
            )))
        };
        if let Err(e) = checked {
            self.discard(fragments);
            return Err(e);
        }

        let margin = self.shared.config.expiring_margin_for(ttl);
        let set = FragmentSet::new(id, params, content_hash, ttl, margin);

        let mut slots = self.shared.slots.write();
        let slot_idx = match slots.iter().position(|s| s.entry.is_none()) {
            Some(idx) => idx,
            None => {
                slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                slots.len() - 1
            }
        };
        let handle = SetHandle::new(slot_idx as u32, slots[slot_idx].generation);
        let entry = Arc::new(SetEntry {
            handle,
            id,
            params,
            set: RwLock::new(set),
            fragments: fragments.into_iter().map(Mutex::new).collect(),
            rescheduled: Notify::new(),
            timer: Mutex::new(None),
        });
        slots[slot_idx].entry = Some(Arc::clone(&entry));
        drop(slots);

        let timer = tokio::spawn(run_expiry(Arc::clone(&self.shared), Arc::clone(&entry)));
        *entry.timer.lock() = Some(timer);

        info!(
            "{} created: {} {}, expires in {:?}",
            handle,
            id.simple(),
            params,
            ttl
        );
        Ok(handle)
    }

    /// Hands every created fragment to its storage location and activates
    /// the ones that were accepted. A fragment the storage refuses is
    /// destroyed locally. Returns the number of active fragments.
    pub async fn distribute(&self, handle: SetHandle) -> Result<usize> {
        let entry = self.entry(handle)?;
        let ttl = entry.snapshot().remaining(Instant::now());

        let mut uploads = Vec::with_capacity(entry.fragments.len());
        for slot in &entry.fragments {
            let (index, location, sealed) = {
                let frag = slot.lock();
                if frag.status() != FragmentStatus::Created {
                    continue;
                }
                (frag.index, frag.location.clone(), frag.sealed().to_vec())
            };
            let storage = Arc::clone(&self.shared.storage);
            let fid = entry.fragment_id(index);
            uploads.push(async move {
                let res = storage.put(&location, &fid, &sealed, ttl).await;
                (index, location, res)
            });
        }

        for (index, location, res) in join_all(uploads).await {
            match res {
                Ok(()) => {
                    entry.fragments[index as usize]
                        .lock()
                        .advance(FragmentStatus::Distributed);
                }
                Err(e) => {
                    warn!(
                        "{} fragment {} was refused by {}: {}",
                        handle, index, location, e
                    );
                    destroy_one(&self.shared, &entry, index as usize).await;
                }
            }
        }

        let expiring = entry.snapshot().is_expiring(Instant::now());
        let mut active = 0;
        for slot in &entry.fragments {
            let mut frag = slot.lock();
            if frag.advance(FragmentStatus::Active) {
                if expiring {
                    frag.advance(FragmentStatus::Expiring);
                }
                active += 1;
            }
        }
        debug!("{} distributed, {} fragments active", handle, active);
        Ok(active)
    }

    /// Pushes the deadline out. Allowed only while the set is not yet
    /// expiring; storage copies are given the new remaining time as well.
    /// Returns the new deadline.
    pub async fn extend_expiration(
        &self,
        handle: SetHandle,
        additional: Duration,
    ) -> Result<Instant> {
        let config = &self.shared.config;
        if additional.is_zero() {
            return Err(EngineError::InvalidTtl {
                requested: additional,
                min: config.min_ttl,
                max: config.max_ttl,
            });
        }

        let entry = self.entry(handle)?;
        if entry.all_terminal() {
            return Err(EngineError::Expired(handle));
        }
        let now = Instant::now();
        let (expires_at, remaining) = {
            let mut set = entry.set.write();
            if set.is_expired(now) {
                return Err(EngineError::Expired(handle));
            }
            if set.is_expiring(now) {
                return Err(EngineError::AlreadyExpiring(handle));
            }
            let remaining = set.remaining(now) + additional;
            if remaining > config.max_ttl {
                return Err(EngineError::InvalidTtl {
                    requested: remaining,
                    min: config.min_ttl,
                    max: config.max_ttl,
                });
            }
            set.extend(additional);
            (set.expires_at, remaining)
        };

        entry.rescheduled.notify_one();
        self.refresh_storage(&entry, remaining).await;
        info!("{} extended by {:?}, {:?} remaining", handle, additional, remaining);
        Ok(expires_at)
    }

    async fn refresh_storage(&self, entry: &SetEntry, ttl: Duration) {
        let held: Vec<(u8, LocationId)> = entry
            .fragments
            .iter()
            .filter_map(|slot| {
                let frag = slot.lock();
                frag.status()
                    .is_readable()
                    .then(|| (frag.index, frag.location.clone()))
            })
            .collect();

        let storage = self.shared.storage.as_ref();
        let refreshes = held.iter().map(|(index, location)| async move {
            let fid = entry.fragment_id(*index);
            (fid, location, storage.refresh(location, &fid, ttl).await)
        });
        for (fid, location, res) in join_all(refreshes).await {
            if let Err(e) = res {
                warn!("{} keeps its old expiry at {}: {}", fid, location, e);
            }
        }
    }

    /// Destroys one fragment ahead of schedule. Returns false if it was
    /// already destroyed.
    pub async fn destroy_fragment(&self, handle: SetHandle, index: u8) -> Result<bool> {
        let entry = self.entry(handle)?;
        if index as usize >= entry.fragments.len() {
            return Err(EngineError::InvalidParameters(format!(
                "{} has no fragment {}",
                handle, index
            )));
        }
        Ok(destroy_one(&self.shared, &entry, index as usize).await)
    }

    /// Destroys every fragment of the set. Returns how many this call
    /// destroyed.
    pub async fn destroy_set(&self, handle: SetHandle) -> Result<usize> {
        let entry = self.entry(handle)?;
        let destroyed = destroy_all(&self.shared, &entry).await;
        if destroyed > 0 {
            info!("{} destroyed early, {} fragments wiped", handle, destroyed);
        }
        Ok(destroyed)
    }

    /// Destroys every fragment locally right away and leaves the remote
    /// deletions to a background task, so the caller never waits on storage.
    /// Returns how many fragments this call wiped.
    pub fn wipe_set(&self, handle: SetHandle) -> Result<usize> {
        let entry = self.entry(handle)?;
        let remote: Vec<(LocationId, FragmentId)> = (0..entry.fragments.len())
            .filter_map(|i| wipe_local(&self.shared, &entry, i))
            .collect();
        let wiped = remote.len();
        if wiped > 0 {
            let storage = Arc::clone(&self.shared.storage);
            tokio::spawn(async move {
                let deletes = remote
                    .iter()
                    .map(|(location, fid)| delete_remote(storage.as_ref(), location, fid));
                join_all(deletes).await;
            });
            info!("{} wiped, {} fragments", handle, wiped);
        }
        Ok(wiped)
    }

    /// Checks, decrypts and validates retrieved bytes for one fragment while
    /// holding that fragment's lock, so a concurrent destruction either
    /// happens entirely before (the read sees it unavailable) or entirely
    /// after. `Ok(None)` means the fragment is no longer readable.
    pub fn read_fragment(
        &self,
        entry: &SetEntry,
        index: u8,
        sealed: &[u8],
    ) -> Result<Option<FragmentBody>> {
        let expired = entry.is_expired(Instant::now());
        let Some(slot) = entry.fragments.get(index as usize) else {
            return Ok(None);
        };
        let mut frag = slot.lock();
        if expired || !frag.status().is_readable() {
            return Ok(None);
        }

        if !frag.verify(sealed) {
            frag.advance(FragmentStatus::Corrupted);
            warn!(
                "{} fragment {} failed its checksum (expected {})",
                entry.handle,
                index,
                hex::encode(frag.checksum)
            );
            return Err(EngineError::Corrupted { index });
        }

        let Some(key) = frag.key() else {
            return Ok(None);
        };
        let body = match FragmentBody::open(key, sealed) {
            Ok(body) => body,
            Err(e) => {
                frag.advance(FragmentStatus::Corrupted);
                warn!("{} fragment {} did not open: {}", entry.handle, index, e);
                return Err(EngineError::Corrupted { index });
            }
        };

        let params = entry.params;
        if body.set_id != *entry.id.as_bytes()
            || body.index != index
            || body.total as usize != params.total()
            || body.threshold as usize != params.threshold()
        {
            frag.advance(FragmentStatus::Corrupted);
            warn!("{} fragment {} carries a foreign header", entry.handle, index);
            return Err(EngineError::Corrupted { index });
        }

        frag.record_access();
        self.shared
            .cache
            .insert(entry.fragment_id(index), sealed.to_vec());
        Ok(Some(body))
    }

    /// Sealed bytes kept from an earlier verified retrieval.
    pub fn cached(&self, fragment: &FragmentId) -> Option<Vec<u8>> {
        self.shared.cache.get(fragment).map(|bytes| bytes.clone())
    }

    pub fn status(&self, handle: SetHandle) -> Result<FragmentSetStatus> {
        let entry = self.entry(handle)?;
        let set = entry.snapshot();
        let now = Instant::now();

        let fragments: Vec<FragmentSnapshot> = entry
            .fragments
            .iter()
            .map(|slot| {
                let frag = slot.lock();
                FragmentSnapshot {
                    index: frag.index,
                    status: frag.status(),
                    location: frag.location.clone(),
                    access_count: frag.access_count(),
                }
            })
            .collect();

        let readable = if set.is_expired(now) {
            0
        } else {
            fragments.iter().filter(|f| f.status.is_readable()).count()
        };

        let state = if fragments.iter().all(|f| f.status.is_terminal()) {
            SetState::Destroyed
        } else if set.is_expiring(now) {
            SetState::Expiring
        } else if fragments
            .iter()
            .any(|f| matches!(f.status, FragmentStatus::Created | FragmentStatus::Distributed))
        {
            SetState::Pending
        } else if readable < set.threshold() {
            SetState::Degraded
        } else {
            SetState::Active
        };

        Ok(FragmentSetStatus {
            handle,
            set_id: set.id,
            total: set.total(),
            threshold: set.threshold(),
            state,
            created_at: set.created_at,
            remaining: set.remaining(now),
            readable,
            fragments,
        })
    }

    pub fn entry(&self, handle: SetHandle) -> Result<Arc<SetEntry>> {
        let slots = self.shared.slots.read();
        slots
            .get(handle.slot())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.clone())
            .ok_or(EngineError::UnknownSet(handle))
    }

    pub fn handles(&self) -> Vec<SetHandle> {
        self.shared
            .slots
            .read()
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(|e| e.handle))
            .collect()
    }

    /// Frees the slots of sets whose fragments are all wiped. Their handles
    /// report `UnknownSet` afterwards. Expired sets are also freed on their
    /// own once `purge_after` has passed.
    pub fn purge_destroyed(&self) -> usize {
        let mut slots = self.shared.slots.write();
        let purged = slots.iter_mut().map(free_slot).filter(|&freed| freed).count();
        if purged > 0 {
            debug!("purged {} destroyed sets", purged);
        }
        purged
    }

    #[cfg(test)]
    pub(crate) fn corrupt_content_hash(&self, handle: SetHandle) {
        if let Ok(entry) = self.entry(handle) {
            entry.set.write().content_hash[0] ^= 0xff;
        }
    }

    fn discard(&self, fragments: Vec<Fragment>) {
        for mut frag in fragments {
            if let Err(e) = self.shared.keys.destroy_key(&frag.key_id) {
                warn!("could not destroy key {}: {}", frag.key_id, e);
            }
            frag.wipe();
        }
    }
}

async fn run_expiry(shared: Arc<Shared>, entry: Arc<SetEntry>) {
    loop {
        let (expiring_at, expires_at) = entry.deadlines();
        let now = Instant::now();
        if now >= expires_at {
            break;
        }
        if now >= expiring_at {
            if entry.mark_expiring(now) {
                debug!("{} is expiring", entry.handle);
            }
            sleep_until(expires_at).await;
            continue;
        }
        tokio::select! {
            _ = sleep_until(expiring_at) => {}
            _ = entry.rescheduled.notified() => {
                debug!("{} rescheduled", entry.handle);
            }
        }
    }

    let destroyed = destroy_all(&shared, &entry).await;
    info!("{} expired, {} fragments destroyed", entry.handle, destroyed);

    // nothing is left for a purge to cancel
    drop(entry.timer.lock().take());
    if let Some(linger) = shared.config.purge_after {
        sleep(linger).await;
        let mut slots = shared.slots.write();
        let freed = match slots.get_mut(entry.handle.slot()) {
            Some(slot) if slot.generation == entry.handle.generation() => free_slot(slot),
            _ => false,
        };
        if freed {
            debug!("{} purged", entry.handle);
        }
    }
}

async fn destroy_all(shared: &Shared, entry: &SetEntry) -> usize {
    let wipes = (0..entry.fragments.len()).map(|i| destroy_one(shared, entry, i));
    join_all(wipes).await.into_iter().filter(|d| *d).count()
}

/// Layered destruction of one fragment: the key (local copy and key store)
/// goes first, then the sealed buffer is overwritten, then cached copies are
/// dropped. All of that happens under the fragment lock. The storage copy is
/// deleted afterwards on a best-effort basis; a failure there is reported
/// but does not undo the local destruction.
async fn destroy_one(shared: &Shared, entry: &SetEntry, index: usize) -> bool {
    let Some((location, fid)) = wipe_local(shared, entry, index) else {
        return false;
    };
    delete_remote(shared.storage.as_ref(), &location, &fid).await;
    true
}

/// The locked part of [`destroy_one`]. Returns where the remote copy lives,
/// or `None` if the fragment was already wiped.
fn wipe_local(
    shared: &Shared,
    entry: &SetEntry,
    index: usize,
) -> Option<(LocationId, FragmentId)> {
    let mut frag = entry.fragments[index].lock();
    if frag.is_wiped() {
        return None;
    }
    if let Err(e) = shared.keys.destroy_key(&frag.key_id) {
        warn!("key store could not destroy {}: {}", frag.key_id, e);
    }
    frag.wipe();
    let fid = entry.fragment_id(frag.index);
    if let Some((_, mut cached)) = shared.cache.remove(&fid) {
        crypto::scrub(&mut cached);
    }
    Some((frag.location.clone(), fid))
}

async fn delete_remote(
    storage: &dyn StorageCollaborator,
    location: &LocationId,
    fid: &FragmentId,
) {
    match storage.delete(location, fid).await {
        Ok(()) => debug!("{} deleted from {}", fid, location),
        Err(e) => warn!(
            "{} destroyed locally, remote deletion at {} failed: {}",
            fid, location, e
        ),
    }
}

/// Frees `slot` if everything in it is wiped.
fn free_slot(slot: &mut Slot) -> bool {
    if !slot.entry.as_ref().is_some_and(|e| e.all_wiped()) {
        return false;
    }
    if let Some(entry) = slot.entry.take() {
        if let Some(timer) = entry.timer.lock().take() {
            timer.abort();
        }
    }
    slot.generation = slot.generation.wrapping_add(1);
    true
}
