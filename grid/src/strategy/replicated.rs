//! Leader-serialized full-copy distribution: every peer holds the complete data set, writes
//! go through the Raft leader so all peers observe the same order.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use storage::{LocalStore, StorageEvent};

use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::endpoint::{Destination, Endpoint, InboundHandler, ResponseData};
use crate::events::EventPipeline;
use crate::ids::EndpointId;
use crate::message::StrategyOp;
use crate::strategy::{decode_pairs, encode_pairs, DistributedStorage};

/// Batch size used for the standalone-to-cluster dump, so a large local store doesn't produce
/// a single oversized request.
const DUMP_CHUNK_SIZE: usize = 256;

pub struct ReplicatedStorage<K, V, S> {
    endpoint: Arc<Endpoint>,
    local: Arc<S>,
    /// Set once this peer has dumped its standalone entries into a newly-discovered cluster.
    dumped: AtomicBool,
    events: EventPipeline<K, V>,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V, S> ReplicatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    pub fn new(endpoint: Arc<Endpoint>, local: Arc<S>, config: &StorageConfig) -> Arc<Self> {
        let events = EventPipeline::spawn(local.events(), config.max_collected_events, config.max_collected_time());
        let storage = Arc::new(ReplicatedStorage { endpoint, local, dumped: AtomicBool::new(false), events, _marker: PhantomData });
        storage.spawn_expiry_listener();
        storage
    }

    /// Every peer expires entries locally and independently; only the leader's expiration
    /// should become a cluster-wide delete, or followers would each broadcast a redundant one.
    fn spawn_expiry_listener(self: &Arc<Self>) {
        let storage = Arc::clone(self);
        let expirations = storage.local.events();
        std::thread::spawn(move || {
            for event in expirations {
                if let StorageEvent::Expired(key, _) = event {
                    if storage.is_leader() {
                        storage.endpoint.notify(Destination::Broadcast, StrategyOp::DeleteEntriesNotification, &[key.encode()], &[]);
                    }
                }
            }
        });
    }

    pub fn local_get(&self, key: &K) -> Option<V> {
        self.local.get(key)
    }

    pub fn local_keys(&self) -> Vec<K> {
        self.local.keys()
    }

    pub fn local_size(&self) -> usize {
        self.local.size()
    }

    fn is_leader(&self) -> bool {
        self.endpoint.current_leader() == Some(self.endpoint.local_id())
    }

    fn is_standalone(&self) -> bool {
        self.endpoint.remote_peers().is_empty()
    }

    /// Dumps this peer's full local copy into the cluster, once, the first time a leader is
    /// learned after running standalone. Called by callers that observe a leader transition;
    /// idempotent if already dumped.
    pub fn dump_if_newly_joined(&self) {
        if self.endpoint.current_leader().is_none() || self.dumped.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = self.local.iterator();
        for chunk in entries.chunks(DUMP_CHUNK_SIZE) {
            let mut keys = Vec::with_capacity(chunk.len());
            let mut values = Vec::with_capacity(chunk.len());
            for (k, v) in chunk {
                keys.push(k.encode());
                values.push(v.encode());
            }
            let outcome = self.endpoint.request(Destination::Leader, StrategyOp::UpdateEntriesRequest, &keys, &values);
            if let Ok(aggregate) = outcome {
                if !aggregate.keys.is_empty() {
                    log::warn!("{} key(s) already existed on the leader during standalone dump", aggregate.keys.len());
                }
            }
        }
    }
}

impl<K, V, S> DistributedStorage<K, V> for ReplicatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.local.get(key)
    }

    fn get_all(&self, keys: &[K]) -> HashMap<K, V> {
        self.local.get_all(keys)
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        if self.is_standalone() {
            return self.local.set(key, value);
        }
        if self.is_leader() {
            let old = self.local.set(key.clone(), value.clone());
            self.endpoint.notify(
                Destination::Broadcast,
                StrategyOp::UpdateEntriesNotification,
                &[key.encode()],
                &[value.encode()],
            );
            return old;
        }
        let aggregate = self
            .endpoint
            .request(Destination::Leader, StrategyOp::UpdateEntriesRequest, &[key.encode()], &[value.encode()])
            .unwrap_or_default();
        aggregate.values.first().and_then(|v| V::decode(v))
    }

    fn insert_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        let mut inserted = HashMap::new();
        for (key, value) in entries {
            if self.get(&key).is_none() {
                self.set(key.clone(), value.clone());
                inserted.insert(key, value);
            }
        }
        inserted
    }

    fn delete(&self, key: &K) -> Option<V> {
        if self.is_standalone() {
            return self.local.delete(key);
        }
        if self.is_leader() {
            let old = self.local.delete(key);
            self.endpoint.notify(Destination::Broadcast, StrategyOp::DeleteEntriesNotification, &[key.encode()], &[]);
            return old;
        }
        let aggregate =
            self.endpoint.request(Destination::Leader, StrategyOp::DeleteEntriesRequest, &[key.encode()], &[]).unwrap_or_default();
        aggregate.values.first().and_then(|v| V::decode(v))
    }

    fn keys(&self) -> Vec<K> {
        self.local.keys()
    }

    fn size(&self) -> usize {
        self.local.size()
    }

    fn clear(&self) {
        self.local.clear();
    }

    /// Every peer already holds the full data set, so there is nothing to fetch remotely —
    /// `iterator-batch-size` is unused here, unlike the partial-copy strategies.
    fn iterator(&self) -> Vec<(K, V)> {
        self.local.iterator()
    }

    fn events(&self) -> Receiver<Vec<StorageEvent<K, V>>> {
        self.events.receiver()
    }

    fn close(&self) {
        self.local.close();
    }
}

impl<K, V, S> InboundHandler for ReplicatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    /// Only the leader answers: it applies the write locally, broadcasts a notification to
    /// followers, and replies to the originator with the pre-write values.
    fn on_update_entries_request(&self, _from: EndpointId, keys: &[Vec<u8>], values: &[Vec<u8>]) -> ResponseData {
        if !self.is_leader() {
            return ResponseData::default();
        }
        let mut response_keys = Vec::new();
        let mut response_values = Vec::new();
        for (key, value) in decode_pairs::<K, V>(keys, values) {
            if let Some(old) = self.local.set(key.clone(), value.clone()) {
                response_keys.push(key.encode());
                response_values.push(old.encode());
            }
        }
        self.endpoint.notify(Destination::Broadcast, StrategyOp::UpdateEntriesNotification, keys, values);
        ResponseData { keys: response_keys, values: response_values }
    }

    fn on_update_entries_notification(&self, _from: EndpointId, keys: &[Vec<u8>], values: &[Vec<u8>]) {
        for (key, value) in decode_pairs::<K, V>(keys, values) {
            self.local.set(key, value);
        }
    }

    fn on_delete_entries_request(&self, _from: EndpointId, keys: &[Vec<u8>]) -> ResponseData {
        if !self.is_leader() {
            return ResponseData::default();
        }
        let decoded: Vec<K> = crate::strategy::decode_keys(keys);
        let deleted = self.local.delete_all(&decoded);
        self.endpoint.notify(Destination::Broadcast, StrategyOp::DeleteEntriesNotification, keys, &[]);
        let (keys, values) = encode_pairs(&deleted);
        ResponseData { keys, values }
    }

    fn on_delete_entries_notification(&self, _from: EndpointId, keys: &[Vec<u8>]) {
        let decoded: Vec<K> = crate::strategy::decode_keys(keys);
        self.local.delete_all(&decoded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::endpoint::Membership;
    use crate::message::Protocol;
    use std::time::Duration;
    use storage::ConcurrentMap;

    struct FixedMembership {
        local: EndpointId,
        remotes: Vec<EndpointId>,
        leader: Option<EndpointId>,
    }

    impl Membership for FixedMembership {
        fn local_id(&self) -> EndpointId {
            self.local
        }
        fn remote_ids(&self) -> Vec<EndpointId> {
            self.remotes.clone()
        }
        fn current_leader(&self) -> Option<EndpointId> {
            self.leader
        }
    }

    fn leader_endpoint() -> Arc<Endpoint> {
        let bus = Arc::new(InProcessBus::new());
        let local = EndpointId::new();
        Endpoint::new(
            Protocol::Replicated,
            "r".to_string(),
            bus,
            Arc::new(FixedMembership { local, remotes: vec![], leader: Some(local) }),
            1_000,
            1_000,
            Duration::from_millis(100),
        )
    }

    fn config(storage_id: &str) -> StorageConfig {
        crate::config::StorageConfigBuilder::new().storage_id(storage_id).build().unwrap()
    }

    #[test]
    fn standalone_writes_apply_locally() {
        let endpoint = leader_endpoint();
        let local = Arc::new(ConcurrentMap::new());
        let storage = ReplicatedStorage::new(endpoint, local, &config("r"));
        assert!(storage.is_standalone());
        assert_eq!(storage.set(1i64, "a".to_string()), None);
        assert_eq!(storage.get(&1i64), Some("a".to_string()));
    }

    #[test]
    fn leader_set_applies_and_broadcasts_without_blocking() {
        let endpoint = leader_endpoint();
        let local = Arc::new(ConcurrentMap::new());
        let storage = ReplicatedStorage::new(endpoint, local, &config("r"));
        assert!(storage.is_leader());
        storage.set(1i64, "a".to_string());
        assert_eq!(storage.get(&1i64), Some("a".to_string()));
    }

    #[test]
    fn leaders_local_expiration_deletes_the_key_on_followers() {
        use storage::TimeLimitedMap;

        let bus = Arc::new(InProcessBus::new());
        let leader_id = EndpointId::new();
        let follower_id = EndpointId::new();

        let leader_endpoint = Endpoint::new(
            Protocol::Replicated,
            "expiring".to_string(),
            Arc::clone(&bus) as Arc<dyn crate::bus::MessageBus>,
            Arc::new(FixedMembership { local: leader_id, remotes: vec![follower_id], leader: Some(leader_id) }),
            1_000,
            1_000,
            Duration::from_millis(100),
        );
        let follower_endpoint = Endpoint::new(
            Protocol::Replicated,
            "expiring".to_string(),
            bus,
            Arc::new(FixedMembership { local: follower_id, remotes: vec![leader_id], leader: Some(leader_id) }),
            1_000,
            1_000,
            Duration::from_millis(100),
        );

        let leader_local = Arc::new(TimeLimitedMap::new());
        let follower_local: Arc<TimeLimitedMap<i64, String>> = Arc::new(TimeLimitedMap::new());
        let leader_storage = ReplicatedStorage::new(Arc::clone(&leader_endpoint), leader_local, &config("expiring"));
        let follower_storage = ReplicatedStorage::new(Arc::clone(&follower_endpoint), follower_local, &config("expiring"));
        leader_endpoint.spawn_dispatch(Arc::clone(&leader_storage) as Arc<dyn InboundHandler>);
        follower_endpoint.spawn_dispatch(Arc::clone(&follower_storage) as Arc<dyn InboundHandler>);

        assert!(leader_storage.is_leader());
        assert!(!follower_storage.is_leader());

        leader_storage.local.set_with_expiry(1i64, "a".to_string(), 1);
        follower_storage.local.set(1i64, "a".to_string());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(leader_storage.local.get(&1i64), None);

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while std::time::Instant::now() < deadline && follower_storage.local_get(&1i64).is_some() {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(follower_storage.local_get(&1i64), None);
    }
}
