//! Raft-based membership and leader election for a grid, layered on top of the `raft` crate's
//! state machine and driven over the shared message bus tagged [`Protocol::Raft`].
//!
//! The Raft peer set itself is fixed at construction, matching the `raft` crate's design (it
//! implements neither membership changes nor snapshots). What *is* dynamic is grid-level
//! liveness: peers are added to the known set on their first heartbeat and dropped — with a
//! [`CoordinatorEvent::PeerDetached`] notification — after `peer-timeout-ms` of silence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info};
use mpb::MPB;
use rand::rngs::StdRng;
use rand::SeedableRng;
use raft::log::memory::InMemoryLog;
use raft::message::{MessageDestination, Rpc, SendableMessage};
use raft::node::{Config as RaftNodeConfig, Node};

use crate::bus::MessageBus;
use crate::config::RaftConfig;
use crate::endpoint::Membership;
use crate::ids::EndpointId;
use crate::message::{Message, MessageKind, Payload, Protocol, RaftRpc, WireLogEntry};

type RaftNode = Node<InMemoryLog, StdRng, EndpointId>;

/// A membership or leadership change a distribution strategy may want to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorEvent {
    LeaderChanged(Option<EndpointId>),
    PeerJoined(EndpointId),
    PeerDetached(EndpointId),
}

/// Drives one grid's Raft node: ticks its timer on a background thread, shuttles
/// [`Protocol::Raft`] traffic to and from the bus, and tracks which configured peers are
/// currently live.
pub struct Coordinator {
    local_id: EndpointId,
    node: Mutex<RaftNode>,
    bus: Arc<dyn MessageBus>,
    live_peers: Mutex<BTreeMap<EndpointId, Instant>>,
    configured_peers: BTreeSet<EndpointId>,
    peer_timeout: Duration,
    heartbeat_interval: Duration,
    events: MPB<CoordinatorEvent>,
    last_known_leader: Mutex<Option<EndpointId>>,
    shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    /// `peers` is the full, fixed membership of the Raft group (local id may be included or
    /// omitted, to the same effect).
    pub fn new(
        local_id: EndpointId,
        peers: BTreeSet<EndpointId>,
        bus: Arc<dyn MessageBus>,
        raft_config: RaftConfig,
    ) -> Arc<Self> {
        let node_config = RaftNodeConfig {
            election_timeout_ticks: (raft_config.min_election_timeout_ms / raft_config.heartbeat_ms).max(1) as u32,
            heartbeat_interval_ticks: 1,
            replication_chunk_size: usize::max_value(),
        };
        let node = Node::new(local_id, peers.clone(), InMemoryLog::new_unbounded(), StdRng::from_entropy(), node_config);

        let configured_peers: BTreeSet<EndpointId> = peers.into_iter().filter(|id| *id != local_id).collect();

        Arc::new(Coordinator {
            local_id,
            node: Mutex::new(node),
            bus,
            live_peers: Mutex::new(BTreeMap::new()),
            configured_peers,
            peer_timeout: raft_config.peer_timeout(),
            heartbeat_interval: raft_config.heartbeat_interval(),
            events: MPB::new(),
            last_known_leader: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Subscribes to leader-change and peer-join/detach notifications.
    pub fn events(&self) -> crossbeam_channel::Receiver<CoordinatorEvent> {
        self.events.receiver()
    }

    /// Spawns the tick and dispatch threads. Idempotent calls would spawn duplicate threads,
    /// so this is expected to be called exactly once by the owning [`crate::grid::Grid`].
    pub fn start(self: &Arc<Self>) {
        let ticker = Arc::clone(self);
        thread::spawn(move || ticker.run_tick_loop());

        let dispatcher = Arc::clone(self);
        let receiver = self.bus.subscribe();
        thread::spawn(move || {
            for message in receiver {
                if dispatcher.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                dispatcher.dispatch(&message);
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn run_tick_loop(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(self.heartbeat_interval);
            let sendables: Vec<SendableMessage<EndpointId>> = {
                let mut node = self.node.lock().expect("raft node poisoned");
                node.timer_tick().collect()
            };
            self.publish_all(sendables);
            self.expire_silent_peers();
            self.check_leader_change();
        }
    }

    fn dispatch(&self, message: &Message) {
        if message.protocol != Protocol::Raft || message.source == self.local_id {
            return;
        }
        self.note_heartbeat(message.source);

        let Payload::Raft(rpc) = &message.payload else { return };
        let Some(term) = message.term else { return };
        let raft_message = raft::message::Message { term: raft::message::TermId { id: term }, rpc: Some(to_raft_rpc(rpc)) };

        let sendables: Vec<SendableMessage<EndpointId>> = {
            let mut node = self.node.lock().expect("raft node poisoned");
            node.receive(raft_message, message.source).collect()
        };
        self.publish_all(sendables);
        self.check_leader_change();
    }

    fn note_heartbeat(&self, peer: EndpointId) {
        if !self.configured_peers.contains(&peer) {
            return;
        }
        let mut live = self.live_peers.lock().expect("live peers poisoned");
        let is_new = !live.contains_key(&peer);
        live.insert(peer, Instant::now());
        drop(live);
        if is_new {
            info!("peer {} joined", peer);
            let _ = self.events.sender().send(CoordinatorEvent::PeerJoined(peer));
        }
    }

    fn expire_silent_peers(&self) {
        let mut live = self.live_peers.lock().expect("live peers poisoned");
        let now = Instant::now();
        let expired: Vec<EndpointId> = live
            .iter()
            .filter(|(_, last_seen)| now.duration_since(**last_seen) > self.peer_timeout)
            .map(|(id, _)| *id)
            .collect();
        for peer in &expired {
            live.remove(peer);
        }
        drop(live);
        for peer in expired {
            info!("peer {} timed out", peer);
            let _ = self.events.sender().send(CoordinatorEvent::PeerDetached(peer));
        }
    }

    fn check_leader_change(&self) {
        let current = {
            let mut node = self.node.lock().expect("raft node poisoned");
            node.leader().0.copied()
        };
        let mut last_known = self.last_known_leader.lock().expect("last known leader poisoned");
        if *last_known != current {
            *last_known = current;
            debug!("leader changed to {:?}", current);
            let _ = self.events.sender().send(CoordinatorEvent::LeaderChanged(current));
        }
    }

    fn publish_all(&self, sendables: Vec<SendableMessage<EndpointId>>) {
        for sendable in sendables {
            let Some(rpc) = &sendable.message.rpc else { continue };
            let destination = match sendable.dest {
                MessageDestination::Broadcast => None,
                MessageDestination::To(id) => Some(id),
            };
            self.bus.publish(Message {
                protocol: Protocol::Raft,
                kind: MessageKind::Raft,
                source: self.local_id,
                destination,
                correlation_id: None,
                storage_id: None,
                keys: Vec::new(),
                values: Vec::new(),
                sequence_number: None,
                term: Some(sendable.message.term.id),
                payload: Payload::Raft(from_raft_rpc(rpc)),
            });
        }
    }
}

impl Membership for Coordinator {
    fn local_id(&self) -> EndpointId {
        self.local_id
    }

    fn remote_ids(&self) -> Vec<EndpointId> {
        self.live_peers.lock().expect("live peers poisoned").keys().copied().collect()
    }

    fn current_leader(&self) -> Option<EndpointId> {
        *self.last_known_leader.lock().expect("last known leader poisoned")
    }
}

fn to_raft_rpc(rpc: &RaftRpc) -> Rpc {
    match rpc {
        RaftRpc::VoteRequest { last_log_idx, last_log_term } => Rpc::VoteRequest(raft::message::VoteRequest {
            last_log_idx: raft::message::LogIndex { id: *last_log_idx },
            last_log_term: raft::message::TermId { id: *last_log_term },
        }),
        RaftRpc::VoteResponse { vote_granted } => Rpc::VoteResponse(raft::message::VoteResponse { vote_granted: *vote_granted }),
        RaftRpc::AppendRequest { prev_log_idx, prev_log_term, leader_commit, entries } => {
            Rpc::AppendRequest(raft::message::AppendRequest {
                prev_log_idx: raft::message::LogIndex { id: *prev_log_idx },
                prev_log_term: raft::message::TermId { id: *prev_log_term },
                leader_commit: raft::message::LogIndex { id: *leader_commit },
                entries: entries
                    .iter()
                    .map(|e| raft::message::LogEntry { term: raft::message::TermId { id: e.term }, data: Bytes::from(e.data.clone()) })
                    .collect(),
            })
        }
        RaftRpc::AppendResponse { success, match_idx, last_log_idx } => Rpc::AppendResponse(raft::message::AppendResponse {
            success: *success,
            match_idx: raft::message::LogIndex { id: *match_idx },
            last_log_idx: raft::message::LogIndex { id: *last_log_idx },
        }),
    }
}

fn from_raft_rpc(rpc: &Rpc) -> RaftRpc {
    match rpc {
        Rpc::VoteRequest(req) => RaftRpc::VoteRequest { last_log_idx: req.last_log_idx.id, last_log_term: req.last_log_term.id },
        Rpc::VoteResponse(res) => RaftRpc::VoteResponse { vote_granted: res.vote_granted },
        Rpc::AppendRequest(req) => RaftRpc::AppendRequest {
            prev_log_idx: req.prev_log_idx.id,
            prev_log_term: req.prev_log_term.id,
            leader_commit: req.leader_commit.id,
            entries: req.entries.iter().map(|e| WireLogEntry { term: e.term.id, data: e.data.to_vec() }).collect(),
        },
        Rpc::AppendResponse(res) => RaftRpc::AppendResponse {
            success: res.success,
            match_idx: res.match_idx.id,
            last_log_idx: res.last_log_idx.id,
        },
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use std::time::Duration as StdDuration;

    #[test]
    fn single_node_cluster_elects_itself_leader() {
        let bus = Arc::new(InProcessBus::new());
        let local = EndpointId::new();
        let mut peers = BTreeSet::new();
        peers.insert(local);

        let raft_config = RaftConfig { min_election_timeout_ms: 20, heartbeat_ms: 5, peer_timeout_ms: 200 };
        let coordinator = Coordinator::new(local, peers, bus, raft_config);
        coordinator.start();

        let deadline = Instant::now() + StdDuration::from_secs(2);
        while Instant::now() < deadline {
            if coordinator.current_leader() == Some(local) {
                break;
            }
            thread::sleep(StdDuration::from_millis(10));
        }
        assert_eq!(coordinator.current_leader(), Some(local));
        coordinator.shutdown();
    }
}
