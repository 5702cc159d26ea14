use std::collections::HashMap;
use std::time::Duration;

use grid::config::StorageConfigBuilder;
use grid::endpoint::Membership;
use grid::strategy::DistributedStorage;

mod common;
use common::{cluster, wait_until};

/// A key/value count well above a deliberately small `max-message-keys`, so `get_all` must
/// split the request into several chunks and merge their responses back together.
#[test]
fn get_all_spanning_many_keys_is_split_into_chunks_and_merged() {
    let grids = cluster(2);
    let config = StorageConfigBuilder::new()
        .storage_id("bulk")
        .max_message_keys(8)
        .max_message_values(8)
        .request_timeout_ms(1_000)
        .build()
        .unwrap();
    let owner = grids[0].build_separated::<String, i64>(config.clone());
    let reader = grids[1].build_separated::<String, i64>(config);

    assert!(wait_until(Duration::from_secs(2), || {
        grids[0].coordinator().remote_ids().contains(&grids[1].local_id())
    }));

    let mut entries = HashMap::new();
    for i in 0..50 {
        entries.insert(format!("key-{}", i), i as i64);
    }
    for (key, value) in entries.clone() {
        owner.set(key, value);
    }

    let fetched = reader.get_all(&entries.keys().cloned().collect::<Vec<_>>());
    assert_eq!(fetched.len(), entries.len());
    for (key, value) in &entries {
        assert_eq!(fetched.get(key), Some(value));
    }
}
