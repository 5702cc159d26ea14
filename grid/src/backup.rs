//! The eviction-aware replica buffer behind Separated storage: keeps exactly one remote copy
//! of each locally-owned entry so ownership can transfer when the owner leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::endpoint::{Destination, Endpoint, InboundHandler, ResponseData};
use crate::error::BackupError;
use crate::ids::EndpointId;
use crate::message::StrategyOp;

/// One entry this node holds as a backup copy on behalf of its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Held {
    owner: EndpointId,
    value: Vec<u8>,
}

/// `save`/`delete`/`evict` are called by the owning peer's Separated storage; inbound
/// `backup-*` messages are handled locally by whichever peer was chosen to hold the copy.
pub struct BackupStorage {
    endpoint: Arc<Endpoint>,
    /// key -> peer currently holding its backup copy, chosen at `save` time.
    choices: Mutex<HashMap<Vec<u8>, EndpointId>>,
    /// Round-robin cursor over the endpoint's remote peers.
    next_peer: AtomicUsize,
    /// Entries this node holds on behalf of some other peer, keyed by (owner, key).
    held: Mutex<HashMap<(EndpointId, Vec<u8>), Held>>,
}

impl BackupStorage {
    pub fn new(endpoint: Arc<Endpoint>) -> Arc<Self> {
        Arc::new(BackupStorage {
            endpoint,
            choices: Mutex::new(HashMap::new()),
            next_peer: AtomicUsize::new(0),
            held: Mutex::new(HashMap::new()),
        })
    }

    /// Places each entry on exactly one remote peer. Keys already backed up keep their
    /// existing peer as long as that peer is still known to the endpoint; otherwise a new
    /// peer is chosen round-robin.
    pub fn save(&self, keys: &[Vec<u8>], values: &[Vec<u8>]) -> Result<(), BackupError> {
        let remotes = self.endpoint.remote_peers();
        if remotes.is_empty() {
            return Err(BackupError::NoLivePeers);
        }

        let mut choices = self.choices.lock().expect("backup choices poisoned");
        let mut by_peer: HashMap<EndpointId, (Vec<Vec<u8>>, Vec<Vec<u8>>)> = HashMap::new();

        for (key, value) in keys.iter().zip(values.iter()) {
            let peer = match choices.get(key).filter(|p| remotes.contains(p)) {
                Some(peer) => *peer,
                None => {
                    let index = self.next_peer.fetch_add(1, Ordering::Relaxed) % remotes.len();
                    remotes[index]
                }
            };
            choices.insert(key.clone(), peer);
            let entry = by_peer.entry(peer).or_default();
            entry.0.push(key.clone());
            entry.1.push(value.clone());
        }
        drop(choices);

        for (peer, (keys, values)) in by_peer {
            self.endpoint.notify(
                Destination::Unicast(peer),
                StrategyOp::BackupSave { owner: self.endpoint.local_id() },
                &keys,
                &values,
            );
        }
        Ok(())
    }

    /// Convenience wrapper for owners that keep working standalone when no peer is available
    /// to hold their backup; the inability to back up a key is logged, not propagated.
    pub fn save_ignore_failure(&self, keys: &[Vec<u8>], values: &[Vec<u8>]) {
        if let Err(err) = self.save(keys, values) {
            log::warn!("could not back up {} key(s): {}", keys.len(), err);
        }
    }

    pub fn delete(&self, keys: &[Vec<u8>]) {
        self.notify_holder(keys, StrategyOp::BackupDelete);
        let mut choices = self.choices.lock().expect("backup choices poisoned");
        for key in keys {
            choices.remove(key);
        }
    }

    pub fn evict(&self, keys: &[Vec<u8>]) {
        self.notify_holder(keys, StrategyOp::BackupEvict);
        let mut choices = self.choices.lock().expect("backup choices poisoned");
        for key in keys {
            choices.remove(key);
        }
    }

    fn notify_holder(&self, keys: &[Vec<u8>], op: StrategyOp) {
        let choices = self.choices.lock().expect("backup choices poisoned");
        let mut by_peer: HashMap<EndpointId, Vec<Vec<u8>>> = HashMap::new();
        for key in keys {
            if let Some(peer) = choices.get(key) {
                by_peer.entry(*peer).or_default().push(key.clone());
            }
        }
        drop(choices);
        for (peer, keys) in by_peer {
            self.endpoint.notify(Destination::Unicast(peer), op.clone(), &keys, &[]);
        }
    }

    /// Returns every entry held on behalf of `peer`, removing them from this node's backup
    /// set. Called when `peer` is detached so its entries can be restored by the new owner.
    pub fn extract(&self, peer: EndpointId) -> HashMap<Vec<u8>, Vec<u8>> {
        let mut held = self.held.lock().expect("backup held entries poisoned");
        let keys: Vec<Vec<u8>> =
            held.keys().filter(|(owner, _)| *owner == peer).map(|(_, key)| key.clone()).collect();

        let mut extracted = HashMap::new();
        for key in keys {
            if let Some(entry) = held.remove(&(peer, key.clone())) {
                extracted.insert(key, entry.value);
            }
        }
        extracted
    }

    /// Number of entries this node currently holds as backup copies for other peers.
    pub fn metrics(&self) -> usize {
        self.held.lock().expect("backup held entries poisoned").len()
    }
}

impl InboundHandler for BackupStorage {
    fn on_backup_save(&self, owner: EndpointId, keys: &[Vec<u8>], values: &[Vec<u8>]) {
        let mut held = self.held.lock().expect("backup held entries poisoned");
        for (key, value) in keys.iter().zip(values.iter()) {
            held.insert((owner, key.clone()), Held { owner, value: value.clone() });
        }
    }

    fn on_backup_delete(&self, keys: &[Vec<u8>]) {
        let mut held = self.held.lock().expect("backup held entries poisoned");
        held.retain(|(_, key), _| !keys.contains(key));
    }

    fn on_backup_evict(&self, keys: &[Vec<u8>]) {
        let mut held = self.held.lock().expect("backup held entries poisoned");
        held.retain(|(_, key), _| !keys.contains(key));
    }

    fn on_backup_get_request(&self, owner: EndpointId) -> ResponseData {
        let held = self.held.lock().expect("backup held entries poisoned");
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for ((held_owner, key), entry) in held.iter() {
            if *held_owner == owner {
                keys.push(key.clone());
                values.push(entry.value.clone());
            }
        }
        ResponseData { keys, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InProcessBus, MessageBus};
    use crate::endpoint::Membership;
    use crate::message::Protocol;
    use std::time::Duration;

    struct FixedMembership {
        local: EndpointId,
        remotes: Vec<EndpointId>,
    }

    impl Membership for FixedMembership {
        fn local_id(&self) -> EndpointId {
            self.local
        }
        fn remote_ids(&self) -> Vec<EndpointId> {
            self.remotes.clone()
        }
        fn current_leader(&self) -> Option<EndpointId> {
            None
        }
    }

    fn endpoint(bus: Arc<dyn MessageBus>, local: EndpointId, remotes: Vec<EndpointId>) -> Arc<Endpoint> {
        Endpoint::new(
            Protocol::Backup,
            "s".to_string(),
            bus,
            Arc::new(FixedMembership { local, remotes }),
            1_000,
            1_000,
            Duration::from_millis(200),
        )
    }

    #[test]
    fn save_with_no_remote_peers_fails() {
        let bus = Arc::new(InProcessBus::new());
        let ep = endpoint(bus, EndpointId::new(), vec![]);
        let backup = BackupStorage::new(ep);
        assert_eq!(backup.save(&[vec![1]], &[vec![2]]), Err(BackupError::NoLivePeers));
    }

    #[test]
    fn extract_drains_only_the_named_owner() {
        let bus = Arc::new(InProcessBus::new());
        let ep = endpoint(bus, EndpointId::new(), vec![]);
        let backup = BackupStorage::new(ep);
        let owner_a = EndpointId::new();
        let owner_b = EndpointId::new();

        backup.on_backup_save(owner_a, &[vec![1]], &[vec![10]]);
        backup.on_backup_save(owner_b, &[vec![2]], &[vec![20]]);

        let extracted = backup.extract(owner_a);
        assert_eq!(extracted.get(&vec![1]), Some(&vec![10]));
        assert_eq!(backup.metrics(), 1);
    }
}
