//! A thread-safe map with optional per-entry expiration.
//!
//! Expiration is checked lazily on access rather than through a background sweeper: an entry
//! whose deadline has passed is only removed (and reported as [`StorageEvent::Expired`]) the
//! next time something touches that key.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crossbeam_channel::Receiver;
use log::warn;
use mpb::MPB;

use crate::expiry::Expiry;
use crate::{LocalStore, StorageEvent};

struct Entry<V> {
    value: V,
    expiry: Option<Expiry>,
}

pub struct TimeLimitedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    entries: Mutex<HashMap<K, Entry<V>>>,
    events: MPB<StorageEvent<K, V>>,
}

impl<K, V> TimeLimitedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        TimeLimitedMap {
            entries: Mutex::new(HashMap::new()),
            events: MPB::new(),
        }
    }

    /// Sets `key` to `value`, expiring after `duration_ms` milliseconds.
    pub fn set_with_expiry(&self, key: K, value: V, duration_ms: u64) -> Option<V> {
        let expiry = match Expiry::new_from_millis(duration_ms) {
            Ok(expiry) => Some(expiry),
            Err(_) => {
                warn!("expiry duration overflowed, entry will not expire");
                None
            }
        };

        let mut entries = self.entries.lock().expect("time-limited map poisoned");
        let old = entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                expiry,
            },
        );

        match old {
            Some(old) => self.publish(StorageEvent::Updated(key, old.value, value)),
            None => self.publish(StorageEvent::Created(key, value)),
        }

        old.map(|e| e.value)
    }

    fn publish(&self, event: StorageEvent<K, V>) {
        let _ = self.events.sender().send(event);
    }

    fn is_live(entry: &Entry<V>) -> bool {
        match &entry.expiry {
            Some(expiry) => !expiry.is_expired(),
            None => true,
        }
    }
}

impl<K, V> Default for TimeLimitedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LocalStore<K, V> for TimeLimitedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("time-limited map poisoned");
        match entries.get(key) {
            Some(entry) if Self::is_live(entry) => Some(entry.value.clone()),
            Some(_) => {
                let expired = entries.remove(key).expect("checked above");
                drop(entries);
                self.publish(StorageEvent::Expired(key.clone(), expired.value));
                None
            }
            None => None,
        }
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        let mut entries = self.entries.lock().expect("time-limited map poisoned");
        let old = entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                expiry: None,
            },
        );
        drop(entries);

        match &old {
            Some(old) if Self::is_live(old) => {
                self.publish(StorageEvent::Updated(key, old.value.clone(), value))
            }
            _ => self.publish(StorageEvent::Created(key, value)),
        }

        old.filter(Self::is_live).map(|e| e.value)
    }

    fn insert_all(&self, new_entries: HashMap<K, V>) -> HashMap<K, V> {
        let mut entries = self.entries.lock().expect("time-limited map poisoned");
        let mut inserted = HashMap::new();
        for (key, value) in new_entries {
            if !entries.contains_key(&key) {
                entries.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        expiry: None,
                    },
                );
                inserted.insert(key, value);
            }
        }
        drop(entries);
        for (key, value) in &inserted {
            self.publish(StorageEvent::Created(key.clone(), value.clone()));
        }
        inserted
    }

    fn delete(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("time-limited map poisoned");
        let removed = entries.remove(key);
        drop(entries);

        removed.filter(Self::is_live).map(|entry| {
            self.publish(StorageEvent::Deleted(key.clone(), entry.value.clone()));
            entry.value
        })
    }

    fn evict(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("time-limited map poisoned");
        let removed = entries.remove(key);
        drop(entries);

        removed.map(|entry| {
            self.publish(StorageEvent::Evicted(key.clone(), entry.value.clone()));
            entry.value
        })
    }

    fn keys(&self) -> Vec<K> {
        let entries = self.entries.lock().expect("time-limited map poisoned");
        entries
            .iter()
            .filter(|(_, e)| Self::is_live(e))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn size(&self) -> usize {
        let entries = self.entries.lock().expect("time-limited map poisoned");
        entries.values().filter(|e| Self::is_live(e)).count()
    }

    fn clear(&self) {
        let mut entries = self.entries.lock().expect("time-limited map poisoned");
        entries.clear();
    }

    fn restore(&self, key: K, value: V) -> bool {
        let mut entries = self.entries.lock().expect("time-limited map poisoned");
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                expiry: None,
            },
        );
        drop(entries);
        self.publish(StorageEvent::Restored(key, value));
        true
    }

    fn iterator(&self) -> Vec<(K, V)> {
        let entries = self.entries.lock().expect("time-limited map poisoned");
        entries
            .iter()
            .filter(|(_, e)| Self::is_live(e))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    fn events(&self) -> Receiver<StorageEvent<K, V>> {
        self.events.receiver()
    }

    fn close(&self) {
        self.publish(StorageEvent::Closing);
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn set_get_and_delete() {
        let map: TimeLimitedMap<String, String> = TimeLimitedMap::new();
        assert_eq!(map.set("k".into(), "v".into()), None);
        assert_eq!(map.get(&"k".into()), Some("v".into()));
        assert_eq!(map.delete(&"k".into()), Some("v".into()));
        assert_eq!(map.get(&"k".into()), None);
    }

    #[test]
    fn expiry_is_lazy() {
        let map: TimeLimitedMap<String, String> = TimeLimitedMap::new();
        map.set_with_expiry("k".into(), "v".into(), 1);
        assert_eq!(map.get(&"k".into()), Some("v".into()));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(map.get(&"k".into()), None);
    }

    #[test]
    fn insert_all_skips_existing() {
        let map: TimeLimitedMap<String, i32> = TimeLimitedMap::new();
        map.set("a".into(), 1);
        let mut batch = HashMap::new();
        batch.insert("a".into(), 99);
        batch.insert("b".into(), 2);
        let inserted = map.insert_all(batch);
        assert_eq!(inserted.len(), 1);
        assert_eq!(map.get(&"a".into()), Some(1));
        assert_eq!(map.get(&"b".into()), Some(2));
    }

    #[test]
    fn restore_rejects_existing_key() {
        let map: TimeLimitedMap<String, i32> = TimeLimitedMap::new();
        assert!(map.restore("a".into(), 1));
        assert!(!map.restore("a".into(), 2));
        assert_eq!(map.get(&"a".into()), Some(1));
    }
}
