use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use grid::bus::{InProcessBus, MessageBus};
use grid::config::{RaftConfig, StorageConfig, StorageConfigBuilder};
use grid::ids::EndpointId;
use grid::Grid;

/// Tight timings so election and peer-timeout scenarios settle within a couple of seconds.
pub fn fast_raft_config() -> RaftConfig {
    RaftConfig { min_election_timeout_ms: 30, heartbeat_ms: 10, peer_timeout_ms: 150 }
}

pub fn storage_config(storage_id: &str) -> StorageConfig {
    StorageConfigBuilder::new().storage_id(storage_id).request_timeout_ms(500).build().unwrap()
}

/// Spins up `count` grids sharing one in-process bus and one Raft group.
pub fn cluster(count: usize) -> Vec<Arc<Grid>> {
    let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
    let ids: Vec<EndpointId> = (0..count).map(|_| EndpointId::new()).collect();
    let peers: BTreeSet<EndpointId> = ids.iter().copied().collect();

    ids.iter().map(|id| Grid::with_bus(*id, peers.clone(), Arc::clone(&bus), fast_raft_config())).collect()
}

/// Polls `predicate` until it returns `true` or `timeout` elapses, returning whether it held.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
