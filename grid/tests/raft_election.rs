use std::time::Duration;

use grid::coordinator::CoordinatorEvent;
use grid::endpoint::Membership;

mod common;
use common::{cluster, wait_until};

#[test]
fn three_peers_converge_on_a_single_leader() {
    let grids = cluster(3);

    let converged = wait_until(Duration::from_secs(3), || {
        let leaders: Vec<_> = grids.iter().map(|g| g.coordinator().current_leader()).collect();
        leaders.iter().all(|l| l.is_some()) && leaders.windows(2).all(|w| w[0] == w[1])
    });

    assert!(converged, "cluster did not converge on a single leader in time");
    let leader = grids[0].coordinator().current_leader().unwrap();
    assert!(grids.iter().map(|g| g.local_id()).any(|id| id == leader));
}

#[test]
fn detached_peer_triggers_peer_detached_event() {
    let grids = cluster(2);
    let events = grids[0].coordinator().events();

    assert!(wait_until(Duration::from_secs(2), || {
        grids[0].coordinator().remote_ids().contains(&grids[1].local_id())
    }));

    grids[1].close();

    let detached = wait_until(Duration::from_secs(2), || {
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::PeerDetached(id) = event {
                if id == grids[1].local_id() {
                    return true;
                }
            }
        }
        false
    });
    assert!(detached, "expected a PeerDetached event for the stopped peer");
}
