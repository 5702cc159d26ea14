//! A thread-safe map without expiration, for strategies that don't need TTLs
//! (Replicated and Federated storage hold full/partial copies with no per-entry lifetime).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crossbeam_channel::Receiver;
use mpb::MPB;

use crate::{LocalStore, StorageEvent};

pub struct ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    entries: Mutex<HashMap<K, V>>,
    events: MPB<StorageEvent<K, V>>,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        ConcurrentMap {
            entries: Mutex::new(HashMap::new()),
            events: MPB::new(),
        }
    }

    fn publish(&self, event: StorageEvent<K, V>) {
        let _ = self.events.sender().send(event);
    }
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LocalStore<K, V> for ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().expect("concurrent map poisoned").get(key).cloned()
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        let old = self
            .entries
            .lock()
            .expect("concurrent map poisoned")
            .insert(key.clone(), value.clone());

        match &old {
            Some(old) => self.publish(StorageEvent::Updated(key, old.clone(), value)),
            None => self.publish(StorageEvent::Created(key, value)),
        }

        old
    }

    fn insert_all(&self, new_entries: HashMap<K, V>) -> HashMap<K, V> {
        let mut entries = self.entries.lock().expect("concurrent map poisoned");
        let mut inserted = HashMap::new();
        for (key, value) in new_entries {
            if !entries.contains_key(&key) {
                entries.insert(key.clone(), value.clone());
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
        let removed = self.entries.lock().expect("concurrent map poisoned").remove(key);
        if let Some(value) = &removed {
            self.publish(StorageEvent::Deleted(key.clone(), value.clone()));
        }
        removed
    }

    fn evict(&self, key: &K) -> Option<V> {
        let removed = self.entries.lock().expect("concurrent map poisoned").remove(key);
        if let Some(value) = &removed {
            self.publish(StorageEvent::Evicted(key.clone(), value.clone()));
        }
        removed
    }

    fn keys(&self) -> Vec<K> {
        self.entries.lock().expect("concurrent map poisoned").keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.entries.lock().expect("concurrent map poisoned").len()
    }

    fn clear(&self) {
        self.entries.lock().expect("concurrent map poisoned").clear();
    }

    fn restore(&self, key: K, value: V) -> bool {
        let mut entries = self.entries.lock().expect("concurrent map poisoned");
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key.clone(), value.clone());
        drop(entries);
        self.publish(StorageEvent::Restored(key, value));
        true
    }

    fn iterator(&self) -> Vec<(K, V)> {
        self.entries
            .lock()
            .expect("concurrent map poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
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

    #[test]
    fn set_get_and_delete() {
        let map: ConcurrentMap<String, i32> = ConcurrentMap::new();
        assert_eq!(map.set("a".into(), 1), None);
        assert_eq!(map.get(&"a".into()), Some(1));
        assert_eq!(map.delete(&"a".into()), Some(1));
        assert_eq!(map.get(&"a".into()), None);
    }

    #[test]
    fn clear_empties_the_map() {
        let map: ConcurrentMap<String, i32> = ConcurrentMap::new();
        map.set("a".into(), 1);
        map.set("b".into(), 2);
        assert_eq!(map.size(), 2);
        map.clear();
        assert!(map.is_empty());
    }
}
