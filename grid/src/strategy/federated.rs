//! Merge-operator distribution: every peer keeps a partial copy, reconciled on read by
//! broadcasting and reducing every peer's local value through a caller-supplied merge function.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use storage::{LocalStore, StorageEvent};

use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::endpoint::{Destination, Endpoint, InboundHandler, ResponseData};
use crate::events::EventPipeline;
use crate::ids::EndpointId;
use crate::message::StrategyOp;
use crate::strategy::{decode_pairs, encode_keys, DistributedStorage};

/// Binary, associativity/commutativity unassumed: the caller is responsible for supplying an
/// operator whose algebraic properties match the convergence guarantees it wants.
pub type MergeOperator<V> = Arc<dyn Fn(V, V) -> V + Send + Sync>;

pub struct FederatedStorage<K, V, S> {
    endpoint: Arc<Endpoint>,
    local: Arc<S>,
    merge: MergeOperator<V>,
    events: EventPipeline<K, V>,
    iterator_batch_size: usize,
    _marker: std::marker::PhantomData<fn(K)>,
}

impl<K, V, S> FederatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    pub fn new(endpoint: Arc<Endpoint>, local: Arc<S>, merge: MergeOperator<V>, config: &StorageConfig) -> Arc<Self> {
        let events = EventPipeline::spawn(local.events(), config.max_collected_events, config.max_collected_time());
        Arc::new(FederatedStorage {
            endpoint,
            local,
            merge,
            events,
            iterator_batch_size: config.iterator_batch_size,
            _marker: std::marker::PhantomData,
        })
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

    fn merge_one(&self, key: &K, incoming: V) -> V {
        match self.local.get(key) {
            Some(existing) => (self.merge)(existing, incoming),
            None => incoming,
        }
    }
}

impl<K, V, S> DistributedStorage<K, V> for FederatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        let aggregate = self.endpoint.request(Destination::Broadcast, StrategyOp::FederatedGetRequest, &[key.encode()], &[]).unwrap_or_default();

        let mut values: Vec<V> = aggregate.values.iter().filter_map(|v| V::decode(v)).collect();
        if let Some(local) = self.local.get(key) {
            values.push(local);
        }
        if values.is_empty() {
            return None;
        }
        let mut iter = values.into_iter();
        let first = iter.next().unwrap();
        Some(iter.fold(first, |acc, v| (self.merge)(acc, v)))
    }

    fn get_all(&self, keys: &[K]) -> HashMap<K, V> {
        keys.iter().filter_map(|k| self.get(k).map(|v| (k.clone(), v))).collect()
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        let previous = self.local.get(&key);
        let merged = self.merge_one(&key, value.clone());
        self.local.set(key.clone(), merged);
        self.endpoint.notify(Destination::Broadcast, StrategyOp::FederatedSetNotification, &[key.encode()], &[value.encode()]);
        previous
    }

    fn insert_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        let mut inserted = HashMap::new();
        for (key, value) in entries {
            if self.local.get(&key).is_none() {
                self.set(key.clone(), value.clone());
                inserted.insert(key, value);
            }
        }
        inserted
    }

    fn delete(&self, key: &K) -> Option<V> {
        self.local.delete(key)
    }

    fn keys(&self) -> Vec<K> {
        let local_keys = self.local.keys();
        let aggregate = self.endpoint.request(Destination::Broadcast, StrategyOp::GetKeysRequest, &[], &[]).unwrap_or_default();
        let mut merged: std::collections::HashSet<K> = local_keys.into_iter().collect();
        merged.extend(crate::strategy::decode_keys::<K>(&aggregate.keys));
        merged.into_iter().collect()
    }

    fn size(&self) -> usize {
        self.keys().len()
    }

    fn clear(&self) {
        self.local.clear();
    }

    /// A cross-cluster snapshot: every locally-held entry, merged with every remaining key
    /// fetched in `iterator-batch-size`-sized pages and reduced through the merge operator.
    fn iterator(&self) -> Vec<(K, V)> {
        let mut entries: HashMap<K, V> = self.local.iterator().into_iter().collect();
        let remote_keys: Vec<K> = self.keys().into_iter().filter(|k| !entries.contains_key(k)).collect();

        for page in remote_keys.chunks(self.iterator_batch_size.max(1)) {
            for (key, value) in self.get_all(page) {
                entries.insert(key, value);
            }
        }
        entries.into_iter().collect()
    }

    fn events(&self) -> Receiver<Vec<StorageEvent<K, V>>> {
        self.events.receiver()
    }

    fn close(&self) {
        self.local.close();
    }
}

impl<K, V, S> InboundHandler for FederatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    fn on_federated_set_notification(&self, _from: EndpointId, keys: &[Vec<u8>], values: &[Vec<u8>]) {
        for (key, value) in decode_pairs::<K, V>(keys, values) {
            let merged = self.merge_one(&key, value);
            self.local.set(key, merged);
        }
    }

    fn on_federated_get_request(&self, _from: EndpointId, keys: &[Vec<u8>]) -> ResponseData {
        let keys: Vec<K> = crate::strategy::decode_keys(keys);
        let mut response_keys = Vec::new();
        let mut response_values = Vec::new();
        for key in keys {
            if let Some(value) = self.local.get(&key) {
                response_keys.push(key.encode());
                response_values.push(value.encode());
            }
        }
        ResponseData { keys: response_keys, values: response_values }
    }

    fn on_get_keys_request(&self, _from: EndpointId) -> ResponseData {
        ResponseData { keys: encode_keys(&self.local.keys()), values: Vec::new() }
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
    }

    impl Membership for FixedMembership {
        fn local_id(&self) -> EndpointId {
            self.local
        }
        fn remote_ids(&self) -> Vec<EndpointId> {
            vec![]
        }
        fn current_leader(&self) -> Option<EndpointId> {
            None
        }
    }

    fn sum_operator() -> MergeOperator<i64> {
        Arc::new(|a: i64, b: i64| a + b)
    }

    #[test]
    fn repeated_local_sets_merge_via_operator() {
        let bus = Arc::new(InProcessBus::new());
        let local_id = EndpointId::new();
        let endpoint = Endpoint::new(
            Protocol::Federated,
            "f".to_string(),
            bus,
            Arc::new(FixedMembership { local: local_id }),
            1_000,
            1_000,
            Duration::from_millis(100),
        );
        let local = Arc::new(ConcurrentMap::new());
        let config = crate::config::StorageConfigBuilder::new().storage_id("f").build().unwrap();
        let storage = FederatedStorage::new(endpoint, local, sum_operator(), &config);

        storage.set("k".to_string(), 2);
        storage.set("k".to_string(), 3);
        assert_eq!(storage.local.get(&"k".to_string()), Some(5));
    }
}
