//! Reconstruction of payloads from retrieved fragments.

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::time::{timeout_at, Instant};

use crate::{
    codec::ErasureCodec,
    collaborators::StorageCollaborator,
    errors::{EngineError, Result},
    lifecycle::{LifecycleManager, ReadableFragment, SetEntry},
    models::{
        envelope::FragmentBody,
        handle::{FragmentId, SetHandle},
        record::ReconstructionRecord,
    },
};

/// Append-only log of reconstruction attempts.
#[derive(Default)]
pub struct RecordLog {
    records: Mutex<Vec<ReconstructionRecord>>,
}

impl RecordLog {
    pub fn append(&self, record: ReconstructionRecord) {
        self.records.lock().push(record);
    }

    pub fn for_set(&self, handle: SetHandle) -> Vec<ReconstructionRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.handle == handle)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<ReconstructionRecord> {
        self.records.lock().clone()
    }
}

pub struct ReconstructionCoordinator {
    lifecycle: LifecycleManager,
    codec: Arc<ErasureCodec>,
    storage: Arc<dyn StorageCollaborator>,
    records: Arc<RecordLog>,
    destroy_on_read: bool,
}

impl ReconstructionCoordinator {
    pub fn new(
        lifecycle: LifecycleManager,
        codec: Arc<ErasureCodec>,
        storage: Arc<dyn StorageCollaborator>,
        destroy_on_read: bool,
    ) -> Self {
        ReconstructionCoordinator {
            lifecycle,
            codec,
            storage,
            records: Arc::new(RecordLog::default()),
            destroy_on_read,
        }
    }

    pub fn records(&self) -> &RecordLog {
        &self.records
    }

    /// Retrieves, verifies and decodes the set's payload within `deadline`.
    /// Every attempt appends exactly one record, whatever its outcome.
    pub async fn reconstruct(&self, handle: SetHandle, deadline: Duration) -> Result<Vec<u8>> {
        let started = Instant::now();
        let at = SystemTime::now();
        let entry = self.lifecycle.entry(handle);
        let set_id = entry.as_ref().map(|e| e.id()).unwrap_or_default();

        let outcome = match &entry {
            Ok(entry) => self.attempt(entry, started + deadline).await,
            Err(_) => Err(EngineError::UnknownSet(handle)),
        };
        let elapsed = started.elapsed();

        let (success, used, failure) = match &outcome {
            Ok((_, used)) => (true, *used, None),
            Err(e) => (false, 0, Some(e.to_string())),
        };
        self.records.append(ReconstructionRecord {
            handle,
            set_id,
            at,
            success,
            fragments_used: used,
            elapsed,
            failure,
        });

        match outcome {
            Ok((payload, used)) => {
                info!(
                    "{} reconstructed from {} fragments in {:?}",
                    handle, used, elapsed
                );
                if self.destroy_on_read {
                    // remote copies are deleted in the background
                    match self.lifecycle.wipe_set(handle) {
                        Ok(wiped) => debug!("{} consumed, {} fragments wiped", handle, wiped),
                        Err(e) => warn!("{} could not be wiped after reading: {}", handle, e),
                    }
                }
                Ok(payload)
            }
            Err(e) => {
                warn!("{} reconstruction failed after {:?}: {}", handle, elapsed, e);
                Err(e)
            }
        }
    }

    async fn attempt(&self, entry: &SetEntry, deadline: Instant) -> Result<(Vec<u8>, usize)> {
        let handle = entry.handle();
        let params = entry.params();
        let k = params.threshold();

        if entry.is_expired(Instant::now()) {
            return Err(EngineError::Expired(handle));
        }

        let readable = entry.readable_by_latency();
        if readable.len() < k {
            return Err(EngineError::InsufficientFragments {
                available: readable.len(),
                required: k,
            });
        }

        let mut pending = readable.into_iter();
        let mut inflight = FuturesUnordered::new();
        for candidate in pending.by_ref().take(k) {
            inflight.push(self.fetch(entry, candidate));
        }

        let mut bodies: Vec<FragmentBody> = Vec::with_capacity(k);
        let gathered = timeout_at(deadline, async {
            while let Some((candidate, fetched)) = inflight.next().await {
                let accepted = match fetched {
                    Ok(Some(sealed)) => {
                        match self.lifecycle.read_fragment(entry, candidate.index, &sealed) {
                            Ok(Some(body)) => {
                                bodies.push(body);
                                true
                            }
                            Ok(None) => {
                                debug!("{} fragment {} no longer readable", handle, candidate.index);
                                false
                            }
                            Err(e) => {
                                warn!("{} substituting for fragment {}: {}", handle, candidate.index, e);
                                false
                            }
                        }
                    }
                    Ok(None) => {
                        warn!(
                            "{} fragment {} missing at {}",
                            handle, candidate.index, candidate.location
                        );
                        false
                    }
                    Err(e) => {
                        warn!(
                            "{} fragment {} unavailable at {}: {}",
                            handle, candidate.index, candidate.location, e
                        );
                        false
                    }
                };

                if bodies.len() >= k {
                    break;
                }
                if !accepted {
                    if let Some(next) = pending.next() {
                        inflight.push(self.fetch(entry, next));
                    }
                }
            }
        })
        .await;

        if gathered.is_err() {
            return Err(EngineError::DeadlineExceeded {
                retrieved: bodies.len(),
                required: k,
            });
        }
        if bodies.len() < k {
            return Err(EngineError::InsufficientFragments {
                available: bodies.len(),
                required: k,
            });
        }

        let original_len = bodies[0].original_len;
        let pad_len = bodies[0].pad_len;
        if bodies
            .iter()
            .any(|b| b.original_len != original_len || b.pad_len != pad_len)
        {
            return Err(EngineError::CorruptedReconstruction(handle));
        }

        let shards: Vec<(u8, &[u8])> = bodies.iter().map(|b| (b.index, b.shard.as_slice())).collect();
        let payload = self
            .codec
            .decode(&shards, params, original_len as usize)
            .map_err(|e| match e {
                EngineError::InvalidParameters(_) => EngineError::CorruptedReconstruction(handle),
                other => other,
            })?;

        if blake3::hash(&payload).as_bytes() != &entry.snapshot().content_hash {
            return Err(EngineError::CorruptedReconstruction(handle));
        }
        Ok((payload, bodies.len()))
    }

    async fn fetch(
        &self,
        entry: &SetEntry,
        candidate: ReadableFragment,
    ) -> (ReadableFragment, Result<Option<Vec<u8>>>) {
        let fid = FragmentId::new(entry.id(), candidate.index);
        if let Some(hit) = self.lifecycle.cached(&fid) {
            return (candidate, Ok(Some(hit)));
        }
        let fetched = self.storage.get(&candidate.location, &fid).await;
        (candidate, fetched)
    }
}
