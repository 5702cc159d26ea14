//! The top-level grid: owns the process-wide bus and Raft coordinator, created before any
//! storage and outliving every storage built on top of it, and the registry used to forward
//! peer-detach notifications to each one.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use storage::{ConcurrentMap, LocalStore, TimeLimitedMap};

use crate::backup::BackupStorage;
use crate::bus::{InProcessBus, MessageBus};
use crate::codec::Codec;
use crate::config::{RaftConfig, StorageConfig};
use crate::coordinator::{Coordinator, CoordinatorEvent};
use crate::endpoint::{Endpoint, InboundHandler, Membership};
use crate::error::BuildError;
use crate::ids::EndpointId;
use crate::message::Protocol;
use crate::strategy::federated::{FederatedStorage, MergeOperator};
use crate::strategy::replicated::ReplicatedStorage;
use crate::strategy::separated::SeparatedStorage;
use crate::strategy::DistributedStorage;

/// A storage registered with a [`Grid`], erased of its key/value types so the grid can route
/// peer-detach notifications and shutdown to it without naming them.
trait Registered: Send + Sync {
    fn on_peer_detached(&self, peer: EndpointId);
    fn close(&self);
}

impl<K, V, S> Registered for SeparatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    fn on_peer_detached(&self, peer: EndpointId) {
        InboundHandler::on_remote_endpoint_detached(self, peer);
    }
    fn close(&self) {
        DistributedStorage::close(self);
    }
}

impl<K, V, S> Registered for ReplicatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    // Every peer holds a full copy, so there is nothing to restore when another peer leaves.
    fn on_peer_detached(&self, _peer: EndpointId) {}
    fn close(&self) {
        DistributedStorage::close(self);
    }
}

impl<K, V, S> Registered for FederatedStorage<K, V, S>
where
    K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
    V: Codec + Clone + Send + Sync + 'static,
    S: LocalStore<K, V> + 'static,
{
    fn on_peer_detached(&self, _peer: EndpointId) {}
    fn close(&self) {
        DistributedStorage::close(self);
    }
}

/// The set of peers sharing one message bus and one Raft cluster.
pub struct Grid {
    local_id: EndpointId,
    bus: Arc<dyn MessageBus>,
    coordinator: Arc<Coordinator>,
    registered: Mutex<Vec<Arc<dyn Registered>>>,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    detach_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Grid {
    /// Builds a grid whose Raft group is exactly `peers` (include `local_id` so this peer
    /// participates in elections; a single-member set runs standalone and self-elects), on a
    /// fresh in-process bus of its own.
    pub fn new(local_id: EndpointId, peers: BTreeSet<EndpointId>, raft_config: RaftConfig) -> Arc<Self> {
        Self::with_bus(local_id, peers, Arc::new(InProcessBus::new()), raft_config)
    }

    /// As [`Grid::new`], but joins an existing bus rather than creating one — the way several
    /// peers of one cluster are wired together in-process, each as its own `Grid`.
    pub fn with_bus(
        local_id: EndpointId,
        peers: BTreeSet<EndpointId>,
        bus: Arc<dyn MessageBus>,
        raft_config: RaftConfig,
    ) -> Arc<Self> {
        let coordinator = Coordinator::new(local_id, peers, Arc::clone(&bus), raft_config);
        coordinator.start();

        let grid = Arc::new(Grid {
            local_id,
            bus,
            coordinator,
            registered: Mutex::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
            detach_listener: Mutex::new(None),
        });
        grid.spawn_detach_listener();
        grid
    }

    pub fn local_id(&self) -> EndpointId {
        self.local_id
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.bus)
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    fn new_endpoint(&self, protocol: Protocol, config: &StorageConfig) -> Arc<Endpoint> {
        let endpoint = Endpoint::new(
            protocol,
            config.storage_id.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.coordinator) as Arc<dyn Membership>,
            config.max_message_keys,
            config.max_message_values,
            config.request_timeout(),
        );
        self.endpoints.lock().expect("grid endpoint registry poisoned").push(Arc::clone(&endpoint));
        endpoint
    }

    fn register(&self, storage: Arc<dyn Registered>) {
        self.registered.lock().expect("grid registry poisoned").push(storage);
    }

    fn spawn_detach_listener(self: &Arc<Self>) {
        let grid = Arc::clone(self);
        let events = self.coordinator.events();
        let handle = std::thread::spawn(move || {
            for event in events {
                if let CoordinatorEvent::PeerDetached(peer) = event {
                    let registered = grid.registered.lock().expect("grid registry poisoned");
                    for storage in registered.iter() {
                        storage.on_peer_detached(peer);
                    }
                    drop(registered);
                    let endpoints = grid.endpoints.lock().expect("grid endpoint registry poisoned");
                    for endpoint in endpoints.iter() {
                        endpoint.handle_peer_detached(peer);
                    }
                }
            }
        });
        *self.detach_listener.lock().expect("grid registry poisoned") = Some(handle);
    }

    /// Builds a Separated storage: each key owned by the first peer to insert it, with its
    /// own backup endpoint placing one replica of every locally-owned entry on a remote peer.
    pub fn build_separated<K, V>(
        self: &Arc<Self>,
        config: StorageConfig,
    ) -> Arc<SeparatedStorage<K, V, TimeLimitedMap<K, V>>>
    where
        K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
        V: Codec + Clone + Send + Sync + 'static,
    {
        let local = Arc::new(TimeLimitedMap::new());

        let backup_endpoint = self.new_endpoint(Protocol::Backup, &config);
        let backup = BackupStorage::new(Arc::clone(&backup_endpoint));
        backup_endpoint.spawn_dispatch(Arc::clone(&backup) as Arc<dyn InboundHandler>);

        let endpoint = self.new_endpoint(Protocol::Separated, &config);
        let storage = SeparatedStorage::new(Arc::clone(&endpoint), backup, local, &config);
        endpoint.spawn_dispatch(Arc::clone(&storage) as Arc<dyn InboundHandler>);

        self.register(Arc::clone(&storage) as Arc<dyn Registered>);
        storage
    }

    /// Builds a Replicated storage: every peer holds a full copy, writes serialize through
    /// the Raft leader. Dumps this peer's standalone entries into the cluster the first time
    /// a leader is learned.
    pub fn build_replicated<K, V>(
        self: &Arc<Self>,
        config: StorageConfig,
    ) -> Arc<ReplicatedStorage<K, V, ConcurrentMap<K, V>>>
    where
        K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
        V: Codec + Clone + Send + Sync + 'static,
    {
        let local = Arc::new(ConcurrentMap::new());
        let endpoint = self.new_endpoint(Protocol::Replicated, &config);
        let storage = ReplicatedStorage::new(Arc::clone(&endpoint), local, &config);
        endpoint.spawn_dispatch(Arc::clone(&storage) as Arc<dyn InboundHandler>);

        self.register(Arc::clone(&storage) as Arc<dyn Registered>);
        self.spawn_dump_listener(Arc::clone(&storage));
        storage
    }

    fn spawn_dump_listener<K, V, S>(self: &Arc<Self>, storage: Arc<ReplicatedStorage<K, V, S>>)
    where
        K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
        V: Codec + Clone + Send + Sync + 'static,
        S: LocalStore<K, V> + 'static,
    {
        let events = self.coordinator.events();
        std::thread::spawn(move || {
            for event in events {
                if let CoordinatorEvent::LeaderChanged(_) = event {
                    storage.dump_if_newly_joined();
                }
            }
        });
    }

    /// Builds a Federated storage: every peer keeps a partial copy, reconciled through
    /// `merge` on both local writes and read fan-out. Fails fast (rather than defaulting
    /// silently) when no merge operator is supplied.
    pub fn build_federated<K, V>(
        self: &Arc<Self>,
        config: StorageConfig,
        merge: Option<MergeOperator<V>>,
    ) -> Result<Arc<FederatedStorage<K, V, ConcurrentMap<K, V>>>, BuildError>
    where
        K: Codec + Eq + Hash + Clone + Send + Sync + 'static,
        V: Codec + Clone + Send + Sync + 'static,
    {
        let merge = merge.ok_or(BuildError::MissingMergeOperator)?;
        let local = Arc::new(ConcurrentMap::new());
        let endpoint = self.new_endpoint(Protocol::Federated, &config);
        let storage = FederatedStorage::new(Arc::clone(&endpoint), local, merge, &config);
        endpoint.spawn_dispatch(Arc::clone(&storage) as Arc<dyn InboundHandler>);

        self.register(Arc::clone(&storage) as Arc<dyn Registered>);
        Ok(storage)
    }

    /// Closes every registered storage, cancels every outstanding request on every endpoint,
    /// and stops the Raft coordinator. The bus itself is dropped with the grid once every
    /// `Arc` clone (storages, endpoints) is gone.
    pub fn close(&self) {
        let registered = self.registered.lock().expect("grid registry poisoned");
        for storage in registered.iter() {
            storage.close();
        }
        drop(registered);
        let endpoints = self.endpoints.lock().expect("grid endpoint registry poisoned");
        for endpoint in endpoints.iter() {
            endpoint.close();
        }
        drop(endpoints);
        self.coordinator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_node_grid() -> Arc<Grid> {
        let local = EndpointId::new();
        let mut peers = BTreeSet::new();
        peers.insert(local);
        Grid::new(local, peers, RaftConfig { min_election_timeout_ms: 20, heartbeat_ms: 5, peer_timeout_ms: 200 })
    }

    fn config(storage_id: &str) -> StorageConfig {
        crate::config::StorageConfigBuilder::new().storage_id(storage_id).request_timeout_ms(200).build().unwrap()
    }

    #[test]
    fn separated_storage_round_trips_locally_when_standalone() {
        let grid = single_node_grid();
        let storage = grid.build_separated::<String, String>(config("kv"));
        assert_eq!(storage.set("a".to_string(), "1".to_string()), None);
        assert_eq!(storage.get(&"a".to_string()), Some("1".to_string()));
    }

    #[test]
    fn federated_build_without_merge_operator_is_refused() {
        let grid = single_node_grid();
        let result = grid.build_federated::<String, i64>(config("counters"), None);
        assert!(matches!(result, Err(BuildError::MissingMergeOperator)));
    }

    #[test]
    fn replicated_storage_applies_writes_while_standalone() {
        let grid = single_node_grid();
        let storage = grid.build_replicated::<String, i64>(config("replicated"));
        storage.set("a".to_string(), 1);
        assert_eq!(storage.get(&"a".to_string()), Some(1));
    }
}
