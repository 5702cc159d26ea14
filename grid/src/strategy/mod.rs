//! The three distribution strategies and the surface they share.

pub mod federated;
pub mod replicated;
pub mod separated;

use std::collections::HashMap;
use std::hash::Hash;

use crossbeam_channel::Receiver;
use storage::StorageEvent;

use crate::codec::Codec;

/// Operations exposed to the application, common to all three distribution strategies. Each
/// strategy also exposes `local_*` variants (inherent methods, not part of this trait) that
/// bypass the network and touch only the local store.
pub trait DistributedStorage<K, V>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V>;

    fn get_all(&self, keys: &[K]) -> HashMap<K, V> {
        keys.iter().filter_map(|k| self.get(k).map(|v| (k.clone(), v))).collect()
    }

    fn set(&self, key: K, value: V) -> Option<V>;

    fn set_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        entries.into_iter().filter_map(|(k, v)| self.set(k.clone(), v).map(|old| (k, old))).collect()
    }

    fn insert_all(&self, entries: HashMap<K, V>) -> HashMap<K, V>;

    fn delete(&self, key: &K) -> Option<V>;

    fn delete_all(&self, keys: &[K]) -> HashMap<K, V> {
        keys.iter().filter_map(|k| self.delete(k).map(|v| (k.clone(), v))).collect()
    }

    fn keys(&self) -> Vec<K>;

    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn clear(&self);

    fn iterator(&self) -> Vec<(K, V)>;

    /// Coalesced batches (by the storage's `max-collected-events`/`max-collected-time-ms`
    /// window), not individual events — see [`crate::events::EventPipeline`].
    fn events(&self) -> Receiver<Vec<StorageEvent<K, V>>>;

    fn close(&self);
}

pub(crate) fn encode_keys<K: Codec>(keys: &[K]) -> Vec<Vec<u8>> {
    keys.iter().map(Codec::encode).collect()
}

pub(crate) fn encode_pairs<K: Codec, V: Codec>(entries: &HashMap<K, V>) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut keys = Vec::with_capacity(entries.len());
    let mut values = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        keys.push(k.encode());
        values.push(v.encode());
    }
    (keys, values)
}

pub(crate) fn decode_pairs<K, V>(keys: &[Vec<u8>], values: &[Vec<u8>]) -> HashMap<K, V>
where
    K: Codec + Eq + Hash,
    V: Codec,
{
    keys.iter()
        .zip(values.iter())
        .filter_map(|(k, v)| Some((K::decode(k)?, V::decode(v)?)))
        .collect()
}

pub(crate) fn decode_keys<K: Codec + Eq + Hash>(keys: &[Vec<u8>]) -> Vec<K> {
    keys.iter().filter_map(|k| K::decode(k)).collect()
}
