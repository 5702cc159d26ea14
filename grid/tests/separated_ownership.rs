use std::time::Duration;

use grid::endpoint::Membership;
use grid::strategy::DistributedStorage;

mod common;
use common::{cluster, storage_config, wait_until};

#[test]
fn write_on_one_peer_is_readable_from_another() {
    let grids = cluster(2);
    let a = grids[0].build_separated::<String, String>(storage_config("kv"));
    let b = grids[1].build_separated::<String, String>(storage_config("kv"));

    assert!(wait_until(Duration::from_secs(2), || {
        grids[0].coordinator().remote_ids().contains(&grids[1].local_id())
    }));

    assert_eq!(a.set("hello".to_string(), "world".to_string()), None);
    assert_eq!(a.local_get(&"hello".to_string()), Some("world".to_string()));

    // b never owned the key locally, so get() must broadcast and find it on a.
    assert_eq!(b.get(&"hello".to_string()), Some("world".to_string()));
    assert_eq!(b.local_get(&"hello".to_string()), None);
}

#[test]
fn keys_merges_local_and_remote_ownership() {
    let grids = cluster(2);
    let a = grids[0].build_separated::<String, String>(storage_config("kv2"));
    let b = grids[1].build_separated::<String, String>(storage_config("kv2"));

    assert!(wait_until(Duration::from_secs(2), || {
        grids[0].coordinator().remote_ids().contains(&grids[1].local_id())
    }));

    a.set("owned-by-a".to_string(), "1".to_string());
    b.set("owned-by-b".to_string(), "2".to_string());

    assert!(wait_until(Duration::from_secs(2), || {
        let keys = a.keys();
        keys.contains(&"owned-by-a".to_string()) && keys.contains(&"owned-by-b".to_string())
    }));
}

#[test]
fn writing_an_unknown_key_claims_it_as_owner_when_no_peer_answers() {
    let grids = cluster(1);
    let storage = grids[0].build_separated::<String, String>(storage_config("solo"));
    assert_eq!(storage.set("k".to_string(), "v".to_string()), None);
    assert_eq!(storage.local_get(&"k".to_string()), Some("v".to_string()));
}

#[test]
fn the_backup_holder_becomes_the_new_owner_once_the_original_owner_detaches() {
    let grids = cluster(2);
    let owner = grids[0].build_separated::<String, String>(storage_config("handoff"));
    let backup_holder = grids[1].build_separated::<String, String>(storage_config("handoff"));

    assert!(wait_until(Duration::from_secs(2), || {
        grids[0].coordinator().remote_ids().contains(&grids[1].local_id())
    }));

    assert_eq!(owner.set("hello".to_string(), "world".to_string()), None);
    assert_eq!(owner.local_get(&"hello".to_string()), Some("world".to_string()));

    // The write's backup copy lands on the only other peer, so it now holds a replica
    // without owning the key locally.
    assert!(wait_until(Duration::from_secs(2), || backup_holder.get(&"hello".to_string()).is_some()));
    assert_eq!(backup_holder.local_get(&"hello".to_string()), None);

    // Detach the owner. Once the backup holder observes the peer-timeout, it restores
    // every entry it was backing up for that peer into its own local store.
    grids[0].close();

    assert!(wait_until(Duration::from_secs(3), || {
        backup_holder.local_get(&"hello".to_string()) == Some("world".to_string())
    }));
}
