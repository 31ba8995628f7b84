//! Public face of the fragmentation engine.

use log::{info, warn};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    codec::{CodecParams, Encoded, ErasureCodec},
    collaborators::{KeyStore, StorageCollaborator},
    config::EngineConfig,
    errors::{EngineError, Result},
    lifecycle::LifecycleManager,
    models::{
        envelope::FragmentBody,
        fragment::Fragment,
        handle::SetHandle,
        key::KeyId,
        placement::{Candidate, PlacementAssignment},
        record::ReconstructionRecord,
        status::FragmentSetStatus,
    },
    placement,
    reconstruct::ReconstructionCoordinator,
};

pub struct Engine {
    config: EngineConfig,
    codec: Arc<ErasureCodec>,
    lifecycle: LifecycleManager,
    coordinator: ReconstructionCoordinator,
    storage: Arc<dyn StorageCollaborator>,
    keys: Arc<dyn KeyStore>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn StorageCollaborator>,
        keys: Arc<dyn KeyStore>,
    ) -> Result<Self> {
        config.validate()?;
        let codec = Arc::new(ErasureCodec::new(config.min_payload_len));
        let lifecycle =
            LifecycleManager::new(config.clone(), Arc::clone(&storage), Arc::clone(&keys));
        let coordinator = ReconstructionCoordinator::new(
            lifecycle.clone(),
            Arc::clone(&codec),
            Arc::clone(&storage),
            config.destroy_on_read,
        );
        Ok(Engine {
            config,
            codec,
            lifecycle,
            coordinator,
            storage,
            keys,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Splits `payload` into `n` sealed fragments, any `k` of which
    /// reconstruct it, places them and arms their destruction `ttl` from now.
    pub async fn fragment(
        &self,
        payload: &[u8],
        n: usize,
        k: usize,
        ttl: Duration,
    ) -> Result<SetHandle> {
        if payload.len() > self.config.max_payload_len {
            return Err(EngineError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_len,
            });
        }
        if k < self.config.min_threshold {
            return Err(EngineError::InvalidParameters(format!(
                "threshold {} is below the configured minimum {}",
                k, self.config.min_threshold
            )));
        }
        let params = CodecParams::new(n, k)?;
        self.config.validate_ttl(ttl)?;

        let assignment = self.plan(n, k, ttl)?;
        let encoded = self.codec.encode(payload, params)?;

        let id = Uuid::new_v4();
        let content_hash = *blake3::hash(payload).as_bytes();
        let fragments = self.seal_fragments(id, params, encoded, &assignment)?;

        let handle = self
            .lifecycle
            .create_expiring_set(id, params, content_hash, fragments, ttl)?;
        let active = self.lifecycle.distribute(handle).await?;
        if active < k {
            self.lifecycle.destroy_set(handle).await?;
            return Err(EngineError::Storage(format!(
                "only {} of {} fragments could be stored, {} required",
                active, n, k
            )));
        }

        info!(
            "{} fragmented {} bytes into {} (content {})",
            handle,
            payload.len(),
            params,
            hex::encode(&content_hash[..8])
        );
        Ok(handle)
    }

    fn seal_fragments(
        &self,
        id: Uuid,
        params: CodecParams,
        encoded: Encoded,
        assignment: &PlacementAssignment,
    ) -> Result<Vec<Fragment>> {
        let mut fragments: Vec<Fragment> = Vec::with_capacity(params.total());
        for (index, shard) in encoded.shards.into_iter().enumerate() {
            let body = FragmentBody {
                set_id: *id.as_bytes(),
                index: index as u8,
                total: params.total() as u8,
                threshold: params.threshold() as u8,
                original_len: encoded.original_len as u64,
                pad_len: encoded.pad_len as u64,
                shard,
            };
            match self.seal_one(body, assignment) {
                Ok(fragment) => fragments.push(fragment),
                Err(e) => {
                    // release what was already keyed
                    for mut done in fragments {
                        self.release_key(&done.key_id);
                        done.wipe();
                    }
                    return Err(e);
                }
            }
        }
        Ok(fragments)
    }

    fn seal_one(&self, body: FragmentBody, assignment: &PlacementAssignment) -> Result<Fragment> {
        let placement = assignment.for_index(body.index).ok_or_else(|| {
            EngineError::InvalidParameters(format!("no placement for fragment {}", body.index))
        })?;
        let key = self
            .keys
            .generate_key(&KeyId::for_fragment(body.set_uuid(), body.index))?;
        let sealed = match body.seal(&key) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.release_key(&key.id);
                return Err(e);
            }
        };
        Ok(Fragment::new(
            body.index,
            key,
            sealed,
            placement.location.clone(),
            placement.latency,
        ))
    }

    fn release_key(&self, id: &KeyId) {
        if let Err(e) = self.keys.destroy_key(id) {
            warn!("could not destroy key {}: {}", id, e);
        }
    }

    pub async fn extend_expiration(&self, handle: SetHandle, additional: Duration) -> Result<()> {
        self.lifecycle.extend_expiration(handle, additional).await?;
        Ok(())
    }

    pub async fn reconstruct(&self, handle: SetHandle, deadline: Duration) -> Result<Vec<u8>> {
        self.coordinator.reconstruct(handle, deadline).await
    }

    pub fn status(&self, handle: SetHandle) -> Result<FragmentSetStatus> {
        self.lifecycle.status(handle)
    }

    pub async fn destroy(&self, handle: SetHandle) -> Result<usize> {
        self.lifecycle.destroy_set(handle).await
    }

    pub fn records(&self, handle: SetHandle) -> Vec<ReconstructionRecord> {
        self.coordinator.records().for_set(handle)
    }

    pub fn all_records(&self) -> Vec<ReconstructionRecord> {
        self.coordinator.records().all()
    }

    pub fn purge_destroyed(&self) -> usize {
        self.lifecycle.purge_destroyed()
    }

    /// Placement of `n` fragments over the configured locations, without
    /// encoding anything.
    pub fn plan(&self, n: usize, k: usize, ttl: Duration) -> Result<PlacementAssignment> {
        let candidates: Vec<Candidate> = self
            .config
            .locations
            .iter()
            .filter_map(|location| {
                match self.storage.latency(&self.config.requester, location) {
                    Some(latency) => Some(Candidate {
                        location: location.clone(),
                        latency,
                    }),
                    None => {
                        warn!("no latency estimate for {}, skipping it", location);
                        None
                    }
                }
            })
            .collect();
        placement::plan(n, k, ttl, &candidates, &self.config.placement_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collaborators::{MemoryKeyStore, MemoryStorage},
        models::{
            fragment::FragmentStatus, handle::FragmentId, key::FragmentKey, placement::LocationId,
            status::SetState,
        },
    };
    use itertools::Itertools;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use rstest::rstest;
    use tokio::time::sleep;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    struct Fixture {
        engine: Engine,
        storage: Arc<MemoryStorage>,
        keys: Arc<MemoryKeyStore>,
    }

    /// `count` locations named loc-0.. with round trips of 1, 2, .. ms.
    fn fixture_with(count: u64, storage: MemoryStorage, config: EngineConfig) -> Fixture {
        let storage = Arc::new(
            (0..count).fold(storage, |s, i| s.with_location(&format!("loc-{}", i), ms(i + 1))),
        );
        let keys = Arc::new(MemoryKeyStore::new());
        let config = EngineConfig {
            locations: storage.locations(),
            ..config
        };
        let engine = Engine::new(config, storage.clone(), keys.clone()).unwrap();
        Fixture {
            engine,
            storage,
            keys,
        }
    }

    fn fixture(count: u64) -> Fixture {
        fixture_with(count, MemoryStorage::new(), EngineConfig::default())
    }

    fn location_of(fx: &Fixture, handle: SetHandle, index: u8) -> (LocationId, FragmentId) {
        let status = fx.engine.status(handle).unwrap();
        let location = status.fragment(index).unwrap().location.clone();
        (location, FragmentId::new(status.set_id, index))
    }

    #[tokio::test(start_paused = true)]
    async fn reconstructs_before_expiry_and_not_after() {
        let fx = fixture(7);
        let data = payload(1000);
        let h = fx.engine.fragment(&data, 7, 5, ms(100)).await.unwrap();

        assert_eq!(fx.engine.status(h).unwrap().state, SetState::Active);
        assert_eq!(fx.engine.reconstruct(h, ms(50)).await.unwrap(), data);

        sleep(ms(150)).await;
        let err = fx.engine.reconstruct(h, ms(50)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Expired(_) | EngineError::InsufficientFragments { .. }
        ));

        let status = fx.engine.status(h).unwrap();
        assert_eq!(status.state, SetState::Destroyed);
        assert_eq!(status.readable, 0);
        assert!(fx.storage.is_empty());
        assert!(fx.keys.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn any_threshold_subset_reconstructs() {
        let data = payload(333);
        for lost in (0u8..7).combinations(2) {
            let fx = fixture(7);
            let h = fx.engine.fragment(&data, 7, 5, ms(500)).await.unwrap();
            for &index in &lost {
                let (location, fid) = location_of(&fx, h, index);
                assert!(fx.storage.lose(&location, &fid));
            }
            assert_eq!(fx.engine.reconstruct(h, ms(100)).await.unwrap(), data);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_destroyed_fragment_below_threshold_fails() {
        let fx = fixture(5);
        let h = fx.engine.fragment(&payload(100), 5, 5, ms(200)).await.unwrap();
        assert!(fx.engine.lifecycle().destroy_fragment(h, 2).await.unwrap());

        let err = fx.engine.reconstruct(h, ms(50)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFragments {
                available: 4,
                required: 5
            }
        ));
        assert_eq!(fx.engine.status(h).unwrap().state, SetState::Degraded);
    }

    #[rstest]
    #[case(50, true)]
    #[case(95, false)]
    #[tokio::test(start_paused = true)]
    async fn extension_only_before_expiring(#[case] at: u64, #[case] allowed: bool) {
        let fx = fixture(3);
        let data = payload(64);
        let h = fx.engine.fragment(&data, 3, 2, ms(100)).await.unwrap();
        sleep(ms(at)).await;

        let res = fx.engine.extend_expiration(h, ms(100)).await;
        if allowed {
            res.unwrap();
            // past the original deadline
            sleep(ms(100)).await;
            assert_eq!(fx.engine.reconstruct(h, ms(20)).await.unwrap(), data);
        } else {
            assert!(matches!(res, Err(EngineError::AlreadyExpiring(_))));
            assert_eq!(fx.engine.status(h).unwrap().state, SetState::Expiring);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_fragment_is_substituted() {
        let fx = fixture(7);
        let data = payload(1000);
        let h = fx.engine.fragment(&data, 7, 5, ms(300)).await.unwrap();

        let fastest = fx.engine.lifecycle().entry(h).unwrap().readable_by_latency()[0].index;
        let (location, fid) = location_of(&fx, h, fastest);
        assert!(fx.storage.tamper(&location, &fid));

        assert_eq!(fx.engine.reconstruct(h, ms(100)).await.unwrap(), data);
        let status = fx.engine.status(h).unwrap();
        assert_eq!(
            status.fragment(fastest).unwrap().status,
            FragmentStatus::Corrupted
        );
        assert_eq!(status.count(FragmentStatus::Corrupted), 1);

        let records = fx.engine.records(h);
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].fragments_used, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_locations_exceed_the_deadline() {
        let fx = fixture_with(
            4,
            MemoryStorage::new().simulating_latency(),
            EngineConfig::default(),
        );
        let h = fx.engine.fragment(&payload(200), 4, 3, ms(1000)).await.unwrap();

        // round trips are 1..4 ms, so three fragments need at least 3 ms
        let err = fx.engine.reconstruct(h, ms(2)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::DeadlineExceeded { required: 3, .. }
        ));
        assert!(fx.engine.reconstruct(h, ms(50)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_on_read_consumes_the_set() {
        let config = EngineConfig {
            destroy_on_read: true,
            ..EngineConfig::default()
        };
        let fx = fixture_with(3, MemoryStorage::new(), config);
        let data = payload(80);
        let h = fx.engine.fragment(&data, 3, 2, ms(500)).await.unwrap();

        assert_eq!(fx.engine.reconstruct(h, ms(50)).await.unwrap(), data);
        assert_eq!(fx.engine.status(h).unwrap().state, SetState::Destroyed);
        assert!(matches!(
            fx.engine.reconstruct(h, ms(50)).await,
            Err(EngineError::InsufficientFragments { available: 0, .. })
        ));
        assert!(matches!(
            fx.engine.extend_expiration(h, ms(100)).await,
            Err(EngineError::Expired(_))
        ));

        sleep(ms(1)).await;
        assert!(fx.storage.is_empty());
    }

    /// Storage whose deletions never finish.
    struct StuckDeletes(Arc<MemoryStorage>);

    #[async_trait::async_trait]
    impl StorageCollaborator for StuckDeletes {
        async fn put(
            &self,
            location: &LocationId,
            fragment: &FragmentId,
            sealed: &[u8],
            ttl: Duration,
        ) -> Result<()> {
            self.0.put(location, fragment, sealed, ttl).await
        }

        async fn get(
            &self,
            location: &LocationId,
            fragment: &FragmentId,
        ) -> Result<Option<Vec<u8>>> {
            self.0.get(location, fragment).await
        }

        async fn refresh(
            &self,
            location: &LocationId,
            fragment: &FragmentId,
            ttl: Duration,
        ) -> Result<()> {
            self.0.refresh(location, fragment, ttl).await
        }

        async fn delete(&self, _location: &LocationId, _fragment: &FragmentId) -> Result<()> {
            futures::future::pending().await
        }

        fn latency(&self, requester: &str, location: &LocationId) -> Option<Duration> {
            self.0.latency(requester, location)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_on_read_does_not_wait_for_remote_deletes() {
        let inner = Arc::new(
            (0..3u64).fold(MemoryStorage::new(), |s, i| {
                s.with_location(&format!("loc-{}", i), ms(i + 1))
            }),
        );
        let config = EngineConfig {
            destroy_on_read: true,
            locations: inner.locations(),
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            config,
            Arc::new(StuckDeletes(inner.clone())),
            Arc::new(MemoryKeyStore::new()),
        )
        .unwrap();
        let data = payload(80);
        let h = engine.fragment(&data, 3, 2, ms(500)).await.unwrap();

        let recovered = tokio::time::timeout(ms(100), engine.reconstruct(h, ms(50)))
            .await
            .expect("reconstruction outlived its deadline")
            .unwrap();
        assert_eq!(recovered, data);
        let status = engine.status(h).unwrap();
        assert_eq!(status.state, SetState::Destroyed);
        assert!(engine.records(h)[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn content_hash_mismatch_is_a_corrupted_reconstruction() {
        let fx = fixture(3);
        let h = fx.engine.fragment(&payload(64), 3, 2, ms(500)).await.unwrap();
        fx.engine.lifecycle().corrupt_content_hash(h);

        let err = fx.engine.reconstruct(h, ms(50)).await.unwrap_err();
        assert!(matches!(err, EngineError::CorruptedReconstruction(c) if c == h));
        let records = fx.engine.records(h);
        assert!(!records[0].success);
        assert_eq!(records[0].fragments_used, 0);
    }

    /// Key store that stops issuing keys after `limit` and cannot destroy.
    struct BrokenKeys {
        issued: AtomicUsize,
        destroy_attempts: AtomicUsize,
        limit: usize,
    }

    impl KeyStore for BrokenKeys {
        fn generate_key(&self, id: &KeyId) -> Result<FragmentKey> {
            if self.issued.fetch_add(1, Ordering::SeqCst) >= self.limit {
                return Err(EngineError::storage("key store is full"));
            }
            MemoryKeyStore::new().generate_key(id)
        }

        fn destroy_key(&self, _id: &KeyId) -> Result<()> {
            self.destroy_attempts.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::storage("key store is unreachable"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sealing_failure_releases_issued_keys() {
        let storage = Arc::new(
            MemoryStorage::new()
                .with_location("a", ms(1))
                .with_location("b", ms(2))
                .with_location("c", ms(3)),
        );
        let keys = Arc::new(BrokenKeys {
            issued: Default::default(),
            destroy_attempts: Default::default(),
            limit: 2,
        });
        let config = EngineConfig::default().with_locations(&["a", "b", "c"]);
        let engine = Engine::new(config, storage.clone(), keys.clone()).unwrap();

        let err = engine.fragment(&payload(64), 3, 2, ms(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert_eq!(keys.destroy_attempts.load(Ordering::SeqCst), 2);
        assert!(storage.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn destroy_racing_a_read_never_yields_bad_output() {
        let data = payload(4096);
        for round in 0..32u8 {
            let fx = fixture(3);
            let h = fx.engine.fragment(&data, 3, 3, ms(5000)).await.unwrap();
            let engine = Arc::new(fx.engine);

            let reader = {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.reconstruct(h, ms(1000)).await })
            };
            let destroyer = {
                let lifecycle = engine.lifecycle().clone();
                tokio::spawn(async move { lifecycle.destroy_fragment(h, round % 3).await })
            };

            assert!(destroyer.await.unwrap().unwrap());
            match reader.await.unwrap() {
                Ok(recovered) => assert_eq!(recovered, data),
                Err(EngineError::InsufficientFragments { .. }) | Err(EngineError::Expired(_)) => {}
                Err(other) => panic!("unexpected outcome: {}", other),
            }
            let status = engine.status(h).unwrap();
            assert_eq!(status.count(FragmentStatus::Corrupted), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_is_recorded() {
        let fx = fixture(3);
        let h = fx.engine.fragment(&payload(64), 3, 2, ms(100)).await.unwrap();

        fx.engine.reconstruct(h, ms(20)).await.unwrap();
        sleep(ms(120)).await;
        fx.engine.reconstruct(h, ms(20)).await.unwrap_err();

        let records = fx.engine.records(h);
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert!(!records[1].success);
        assert!(records[1].failure.is_some());

        let stale = SetHandle::new(42, 0);
        assert!(matches!(
            fx.engine.reconstruct(stale, ms(20)).await,
            Err(EngineError::UnknownSet(_))
        ));
        assert_eq!(fx.engine.all_records().len(), 3);
    }

    #[rstest]
    #[case(ms(0))]
    #[case(Duration::from_secs(11))]
    #[tokio::test(start_paused = true)]
    async fn out_of_range_ttls_are_refused(#[case] ttl: Duration) {
        let fx = fixture(3);
        assert!(matches!(
            fx.engine.fragment(&payload(64), 3, 2, ttl).await,
            Err(EngineError::InvalidTtl { .. })
        ));
        assert!(fx.keys.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_bad_shapes_and_sizes() {
        let fx = fixture(3);
        let too_big = vec![0u8; fx.engine.config().max_payload_len + 1];
        assert!(matches!(
            fx.engine.fragment(&too_big, 3, 2, ms(100)).await,
            Err(EngineError::PayloadTooLarge { .. })
        ));
        assert!(matches!(
            fx.engine.fragment(&payload(10), 3, 1, ms(100)).await,
            Err(EngineError::InvalidParameters(_))
        ));
        assert!(matches!(
            fx.engine.fragment(&payload(10), 2, 3, ms(100)).await,
            Err(EngineError::InvalidParameters(_))
        ));
        assert!(matches!(
            fx.engine.fragment(&payload(10), 5, 4, ms(100)).await,
            Err(EngineError::UnsatisfiablePlacement {
                eligible: 3,
                required: 4
            })
        ));
        assert!(fx.keys.is_empty());
        assert!(fx.storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_locations_degrade_or_fail_the_set() {
        let fx = fixture(4);
        fx.storage.set_offline("loc-3", true);
        let data = payload(64);
        let h = fx.engine.fragment(&data, 4, 3, ms(200)).await.unwrap();
        let status = fx.engine.status(h).unwrap();
        assert_eq!(status.readable, 3);
        assert_eq!(status.count(FragmentStatus::Destroyed), 1);
        assert_eq!(fx.engine.reconstruct(h, ms(20)).await.unwrap(), data);

        fx.storage.set_offline("loc-2", true);
        assert!(matches!(
            fx.engine.fragment(&data, 4, 3, ms(200)).await,
            Err(EngineError::Storage(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_frees_destroyed_sets() {
        let fx = fixture(3);
        let h = fx.engine.fragment(&payload(64), 3, 2, ms(50)).await.unwrap();
        let kept = fx.engine.fragment(&payload(64), 3, 2, ms(500)).await.unwrap();

        sleep(ms(100)).await;
        assert_eq!(fx.engine.purge_destroyed(), 1);
        assert!(matches!(
            fx.engine.status(h),
            Err(EngineError::UnknownSet(_))
        ));
        assert_eq!(fx.engine.status(kept).unwrap().state, SetState::Active);

        let reused = fx.engine.fragment(&payload(64), 3, 2, ms(50)).await.unwrap();
        assert_ne!(reused, h);
    }

    #[test]
    fn plan_skips_unknown_locations() {
        let storage = Arc::new(MemoryStorage::new().with_location("near", ms(1)));
        let config = EngineConfig::default().with_locations(&["near", "nowhere"]);
        let engine = Engine::new(config, storage, Arc::new(MemoryKeyStore::new())).unwrap();
        let plan = engine.plan(2, 1, ms(100)).unwrap();
        assert!(plan
            .placements
            .iter()
            .all(|p| p.location.as_str() == "near"));
    }
}
