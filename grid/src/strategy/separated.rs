//! Owner-discovery distribution: each key lives on exactly one peer, the first to insert it.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use storage::{LocalStore, StorageEvent};

use crate::backup::BackupStorage;
use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::endpoint::{Aggregate, Destination, Endpoint, InboundHandler, ResponseData};
use crate::error::OperationError;
use crate::events::EventPipeline;
use crate::ids::EndpointId;
use crate::message::StrategyOp;
use crate::strategy::{decode_keys, decode_pairs, encode_keys, DistributedStorage};

pub struct SeparatedStorage<K, V, S> {
    endpoint: Arc<Endpoint>,
    backup: Arc<BackupStorage>,
    local: Arc<S>,
    events: EventPipeline<K, V>,
    iterator_batch_size: usize,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V, S> SeparatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    /// `endpoint` and `backup` must already be wired to the same bus and membership; the
    /// caller (typically [`crate::grid::Grid`]) owns spawning their dispatch loops.
    pub fn new(endpoint: Arc<Endpoint>, backup: Arc<BackupStorage>, local: Arc<S>, config: &StorageConfig) -> Arc<Self> {
        let events = EventPipeline::spawn(local.events(), config.max_collected_events, config.max_collected_time());
        Arc::new(SeparatedStorage {
            endpoint,
            backup,
            local,
            events,
            iterator_batch_size: config.iterator_batch_size,
            _marker: PhantomData,
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

    fn request(&self, op: StrategyOp, keys: &[Vec<u8>], values: &[Vec<u8>]) -> Aggregate {
        self.endpoint.request(Destination::Broadcast, op, keys, values).unwrap_or_default()
    }
}

impl<K, V, S> DistributedStorage<K, V> for SeparatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        if let Some(value) = self.local.get(key) {
            return Some(value);
        }
        let aggregate = self.request(StrategyOp::GetEntriesRequest, &[key.encode()], &[]);
        aggregate.values.first().and_then(|v| V::decode(v))
    }

    fn get_all(&self, keys: &[K]) -> HashMap<K, V> {
        let mut found = self.local.get_all(keys);
        let missing: Vec<K> = keys.iter().filter(|k| !found.contains_key(k)).cloned().collect();
        if missing.is_empty() {
            return found;
        }
        let aggregate = self.request(StrategyOp::GetEntriesRequest, &encode_keys(&missing), &[]);
        found.extend(decode_pairs::<K, V>(&aggregate.keys, &aggregate.values));
        found
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        if self.local.get(&key).is_some() {
            let old = self.local.set(key.clone(), value.clone());
            self.backup.save_ignore_failure(&[key.encode()], &[value.encode()]);
            self.endpoint.notify(Destination::Broadcast, StrategyOp::UpdateEntriesNotification, &[key.encode()], &[value.encode()]);
            return old;
        }

        let aggregate =
            self.endpoint.request(Destination::Broadcast, StrategyOp::UpdateEntriesRequest, &[key.encode()], &[value.encode()]);
        match aggregate {
            Ok(aggregate) if !aggregate.keys.is_empty() => aggregate.values.first().and_then(|v| V::decode(v)),
            _ => {
                self.local.set(key.clone(), value.clone());
                self.backup.save_ignore_failure(&[key.encode()], &[value.encode()]);
                None
            }
        }
    }

    fn insert_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        let mut inserted = HashMap::new();
        for (key, value) in entries {
            if self.get(&key).is_none() {
                self.local.set(key.clone(), value.clone());
                self.backup.save_ignore_failure(&[key.encode()], &[value.encode()]);
                self.endpoint.notify(
                    Destination::Broadcast,
                    StrategyOp::UpdateEntriesNotification,
                    &[key.encode()],
                    &[value.encode()],
                );
                inserted.insert(key, value);
            }
        }
        inserted
    }

    fn delete(&self, key: &K) -> Option<V> {
        if let Some(old) = self.local.delete(key) {
            self.backup.delete(&[key.encode()]);
            self.endpoint.notify(Destination::Broadcast, StrategyOp::DeleteEntriesNotification, &[key.encode()], &[]);
            return Some(old);
        }
        let aggregate = self.request(StrategyOp::DeleteEntriesRequest, &[key.encode()], &[]);
        aggregate.values.first().and_then(|v| V::decode(v))
    }

    fn keys(&self) -> Vec<K> {
        let local_keys = self.local.keys();
        let aggregate = self.request(StrategyOp::GetKeysRequest, &[], &[]);
        let mut merged: std::collections::HashSet<K> = local_keys.into_iter().collect();
        merged.extend(decode_keys::<K>(&aggregate.keys));
        merged.into_iter().collect()
    }

    fn size(&self) -> usize {
        self.keys().len()
    }

    fn clear(&self) {
        self.local.clear();
    }

    /// A cross-cluster snapshot: every locally-owned entry, plus every remaining key fetched
    /// from its owner in `iterator-batch-size`-sized pages.
    fn iterator(&self) -> Vec<(K, V)> {
        let mut entries = self.local.iterator();
        let local_keys: std::collections::HashSet<K> = entries.iter().map(|(k, _)| k.clone()).collect();
        let remote_keys: Vec<K> = self.keys().into_iter().filter(|k| !local_keys.contains(k)).collect();

        for page in remote_keys.chunks(self.iterator_batch_size.max(1)) {
            let fetched = self.get_all(page);
            entries.extend(fetched);
        }
        entries
    }

    fn events(&self) -> Receiver<Vec<StorageEvent<K, V>>> {
        self.events.receiver()
    }

    fn close(&self) {
        self.local.close();
    }
}

impl<K, V, S> InboundHandler for SeparatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    fn on_get_entries_request(&self, _from: EndpointId, keys: &[Vec<u8>]) -> ResponseData {
        let keys: Vec<K> = decode_keys(keys);
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

    fn on_delete_entries_request(&self, _from: EndpointId, keys: &[Vec<u8>]) -> ResponseData {
        let keys: Vec<K> = decode_keys(keys);
        let deleted = self.local.delete_all(&keys);
        if !deleted.is_empty() {
            let encoded_keys: Vec<Vec<u8>> = deleted.keys().map(Codec::encode).collect();
            self.backup.delete(&encoded_keys);
        }
        let (keys, values) = crate::strategy::encode_pairs(&deleted);
        ResponseData { keys, values }
    }

    fn on_update_entries_notification(&self, _from: EndpointId, keys: &[Vec<u8>], values: &[Vec<u8>]) {
        for (key, value) in decode_pairs::<K, V>(keys, values) {
            if self.local.get(&key).is_some() {
                self.local.set(key.clone(), value.clone());
                self.backup.save_ignore_failure(&[key.encode()], &[value.encode()]);
            }
        }
    }

    fn on_update_entries_request(&self, _from: EndpointId, keys: &[Vec<u8>], values: &[Vec<u8>]) -> ResponseData {
        let mut response_keys = Vec::new();
        let mut response_values = Vec::new();
        for (key, value) in decode_pairs::<K, V>(keys, values) {
            if self.local.get(&key).is_some() {
                if let Some(old) = self.local.set(key.clone(), value.clone()) {
                    self.backup.save_ignore_failure(&[key.encode()], &[value.encode()]);
                    response_keys.push(key.encode());
                    response_values.push(old.encode());
                }
            }
        }
        ResponseData { keys: response_keys, values: response_values }
    }

    fn on_delete_entries_notification(&self, _from: EndpointId, keys: &[Vec<u8>]) {
        let keys: Vec<K> = decode_keys(keys);
        let deleted = self.local.delete_all(&keys);
        if !deleted.is_empty() {
            let encoded_keys: Vec<Vec<u8>> = deleted.keys().map(Codec::encode).collect();
            self.backup.delete(&encoded_keys);
        }
    }

    fn on_remote_endpoint_detached(&self, endpoint: EndpointId) {
        let extracted = self.backup.extract(endpoint);
        if extracted.is_empty() {
            return;
        }
        let decoded: HashMap<K, V> = extracted
            .iter()
            .filter_map(|(k, v)| Some((K::decode(k)?, V::decode(v)?)))
            .collect();
        let attempted = decoded.len();
        let restored = self.local.restore_all(decoded);
        if restored.len() < attempted {
            log::warn!("{}", OperationError::AlreadyPresent);
        }
        if !restored.is_empty() {
            let (keys, values) = crate::strategy::encode_pairs(&restored);
            self.backup.save_ignore_failure(&keys, &values);
        }
    }
}
