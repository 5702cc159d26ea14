//! The local key-value store contract consumed by the grid, plus two thread-safe
//! in-memory implementations used as the defaults in tests and by the reference
//! builders: [`TimeLimitedMap`](time_limited::TimeLimitedMap) (supports per-entry
//! expiration) and [`ConcurrentMap`](concurrent::ConcurrentMap) (no expiration,
//! slightly cheaper, used by strategies that don't need TTLs).
//!
//! Everything in this crate is an external collaborator as far as the grid is
//! concerned: the grid only ever talks to the [`LocalStore`] trait.

use std::collections::HashMap;
use std::hash::Hash;

use crossbeam_channel::Receiver;

pub mod concurrent;
pub mod expiry;
pub mod time_limited;

pub use concurrent::ConcurrentMap;
pub use expiry::Expiry;
pub use time_limited::TimeLimitedMap;

/// A change observed on a [`LocalStore`], delivered to subscribers of [`LocalStore::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent<K, V> {
    Created(K, V),
    Updated(K, V, V),
    Deleted(K, V),
    Expired(K, V),
    Evicted(K, V),
    Restored(K, V),
    Closing,
}

/// The contract a local store must satisfy to back a distributed storage.
///
/// Implementations must be safe to mutate concurrently from both the public API and the
/// endpoint's inbound handlers, since both run on the grid's scheduling pool.
pub trait LocalStore<K, V>: Send + Sync
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V>;

    fn get_all(&self, keys: &[K]) -> HashMap<K, V> {
        keys.iter()
            .filter_map(|k| self.get(k).map(|v| (k.clone(), v)))
            .collect()
    }

    /// Sets `key` to `value` unconditionally, returning the previous value if any.
    fn set(&self, key: K, value: V) -> Option<V>;

    fn set_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        entries
            .into_iter()
            .filter_map(|(k, v)| self.set(k.clone(), v).map(|old| (k, old)))
            .collect()
    }

    /// Inserts every entry whose key is not already present. Returns the subset that was
    /// actually inserted.
    fn insert_all(&self, entries: HashMap<K, V>) -> HashMap<K, V>;

    fn delete(&self, key: &K) -> Option<V>;

    fn delete_all(&self, keys: &[K]) -> HashMap<K, V> {
        keys.iter()
            .filter_map(|k| self.delete(k).map(|v| (k.clone(), v)))
            .collect()
    }

    /// Removes `key` as part of a backup handoff, distinct from an ordinary [`delete`](Self::delete)
    /// in that it emits [`StorageEvent::Evicted`] rather than [`StorageEvent::Deleted`].
    fn evict(&self, key: &K) -> Option<V>;

    fn evict_all(&self, keys: &[K]) -> HashMap<K, V> {
        keys.iter()
            .filter_map(|k| self.evict(k).map(|v| (k.clone(), v)))
            .collect()
    }

    fn keys(&self) -> Vec<K>;

    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn clear(&self);

    /// Restores a previously-evicted entry. Returns `false` (a logical error to the caller)
    /// if the key is already present.
    fn restore(&self, key: K, value: V) -> bool;

    fn restore_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        entries
            .into_iter()
            .filter(|(k, v)| self.restore(k.clone(), v.clone()))
            .collect()
    }

    /// A point-in-time snapshot of all entries, for cross-cluster iteration.
    fn iterator(&self) -> Vec<(K, V)>;

    fn events(&self) -> Receiver<StorageEvent<K, V>>;

    fn close(&self);
}
