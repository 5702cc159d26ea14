use std::time::Duration;

use grid::endpoint::Membership;
use grid::strategy::DistributedStorage;

mod common;
use common::{cluster, storage_config, wait_until};

#[test]
fn write_through_any_peer_is_visible_on_every_peer_once_replicated() {
    let grids = cluster(3);
    let storages: Vec<_> = grids.iter().map(|g| g.build_replicated::<String, i64>(storage_config("counters"))).collect();

    assert!(wait_until(Duration::from_secs(3), || grids.iter().all(|g| g.coordinator().current_leader().is_some())));

    // whichever peer we write through, the write is serialized via the leader.
    storages[1].set("writes".to_string(), 7);

    let replicated = wait_until(Duration::from_secs(2), || storages.iter().all(|s| s.get(&"writes".to_string()) == Some(7)));
    assert!(replicated, "write did not reach every replica");
}

#[test]
fn standalone_replicated_peer_serves_writes_locally() {
    let grids = cluster(1);
    let storage = grids[0].build_replicated::<String, i64>(storage_config("solo-counters"));
    storage.set("a".to_string(), 1);
    assert_eq!(storage.get(&"a".to_string()), Some(1));
}
