//! The per-storage request/response layer: correlates outbound requests with inbound
//! responses, fans out to remote peers, and dispatches inbound requests/notifications to
//! the storage that owns them.

use std::collections::HashMap as Map;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::warn;
use rayon::ThreadPoolBuilder;

use crate::batch;
use crate::bus::MessageBus;
use crate::error::{EndpointError, OperationError};
use crate::ids::{EndpointId, StorageId};
use crate::message::{CorrelationId, Message, MessageKind, Payload, Protocol, StrategyOp};

/// Where an outbound request should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(EndpointId),
    Broadcast,
    Leader,
}

/// Tells an endpoint which remote peers exist and who the current Raft leader is. Implemented
/// by [`crate::coordinator::Coordinator`]; a fixed-peer-set stub is used in single-storage tests.
pub trait Membership: Send + Sync {
    fn local_id(&self) -> EndpointId;
    fn remote_ids(&self) -> Vec<EndpointId>;
    fn current_leader(&self) -> Option<EndpointId>;
}

/// One method per inbound message kind a storage may receive, each defaulting to a no-op so
/// a strategy only overrides what it actually handles. Request handlers return the payload
/// of the response to publish (`None` suppresses the reply); notification handlers return
/// nothing.
pub trait InboundHandler: Send + Sync {
    fn on_get_entries_request(&self, _from: EndpointId, _keys: &[Vec<u8>]) -> ResponseData {
        ResponseData::default()
    }

    fn on_get_keys_request(&self, _from: EndpointId) -> ResponseData {
        ResponseData::default()
    }

    fn on_delete_entries_request(&self, _from: EndpointId, _keys: &[Vec<u8>]) -> ResponseData {
        ResponseData::default()
    }

    fn on_update_entries_notification(&self, _from: EndpointId, _keys: &[Vec<u8>], _values: &[Vec<u8>]) {}

    fn on_update_entries_request(&self, _from: EndpointId, _keys: &[Vec<u8>], _values: &[Vec<u8>]) -> ResponseData {
        ResponseData::default()
    }

    fn on_delete_entries_notification(&self, _from: EndpointId, _keys: &[Vec<u8>]) {}

    fn on_remote_endpoint_detached(&self, _endpoint: EndpointId) {}

    fn on_federated_set_notification(&self, _from: EndpointId, _keys: &[Vec<u8>], _values: &[Vec<u8>]) {}

    fn on_federated_get_request(&self, _from: EndpointId, _keys: &[Vec<u8>]) -> ResponseData {
        ResponseData::default()
    }

    fn on_backup_save(&self, _owner: EndpointId, _keys: &[Vec<u8>], _values: &[Vec<u8>]) {}

    fn on_backup_delete(&self, _keys: &[Vec<u8>]) {}

    fn on_backup_evict(&self, _keys: &[Vec<u8>]) {}

    fn on_backup_get_request(&self, _owner: EndpointId) -> ResponseData {
        ResponseData::default()
    }
}

/// The keys/values a request handler hands back for the endpoint to publish as a response.
#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
}

/// A request's outcome once its waiter resolves: the merged keys/values across every
/// responder, any expected responder that never answered, and any key two responders
/// disagreed on (last writer, by arrival order, wins the merge; the caller can still see
/// that it happened).
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub missing: Vec<EndpointId>,
    pub conflicts: Vec<Vec<u8>>,
}

struct WaiterState {
    expected: Vec<EndpointId>,
    received: std::collections::HashSet<EndpointId>,
    merged: Map<Vec<u8>, Vec<u8>>,
    conflicts: Vec<Vec<u8>>,
    done: bool,
    cancelled: bool,
}

struct Waiter {
    state: Mutex<WaiterState>,
    condvar: Condvar,
}

/// The per-storage messaging front-end. One endpoint exists per (protocol, storage id) pair
/// on the local process; the strategy that owns it drives requests through it and receives
/// inbound traffic through its registered [`InboundHandler`].
pub struct Endpoint {
    id: EndpointId,
    protocol: Protocol,
    storage_id: StorageId,
    bus: Arc<dyn MessageBus>,
    membership: Arc<dyn Membership>,
    max_message_keys: usize,
    max_message_values: usize,
    request_timeout: Duration,
    waiters: Mutex<Map<CorrelationId, Arc<Waiter>>>,
}

impl Endpoint {
    pub fn new(
        protocol: Protocol,
        storage_id: StorageId,
        bus: Arc<dyn MessageBus>,
        membership: Arc<dyn Membership>,
        max_message_keys: usize,
        max_message_values: usize,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Endpoint {
            id: membership.local_id(),
            protocol,
            storage_id,
            bus,
            membership,
            max_message_keys,
            max_message_values,
            request_timeout,
            waiters: Mutex::new(Map::new()),
        })
    }

    pub fn local_id(&self) -> EndpointId {
        self.id
    }

    pub fn remote_peers(&self) -> Vec<EndpointId> {
        self.membership.remote_ids()
    }

    pub fn current_leader(&self) -> Option<EndpointId> {
        self.membership.current_leader()
    }

    /// Spawns the inbound dispatch loop: a supervisor thread reads every message on the bus
    /// and hands matching ones off to a dedicated `rayon` pool, so one slow inbound handler
    /// (a local-store write, say) doesn't stall delivery of the next message. Returns a join
    /// handle the owner keeps to shut the loop down with the storage.
    pub fn spawn_dispatch(self: &Arc<Self>, handler: Arc<dyn InboundHandler>) -> std::thread::JoinHandle<()> {
        let endpoint = Arc::clone(self);
        let receiver = self.bus.subscribe();
        std::thread::spawn(move || {
            let pool = ThreadPoolBuilder::new()
                .thread_name(|i| format!("endpoint-dispatch-{}", i))
                .build()
                .expect("failed to build endpoint dispatch thread pool");
            for message in receiver {
                let endpoint = Arc::clone(&endpoint);
                let handler = Arc::clone(&handler);
                pool.spawn(move || endpoint.dispatch(&message, handler.as_ref()));
            }
        })
    }

    fn dispatch(&self, message: &Message, handler: &dyn InboundHandler) {
        if message.source == self.id {
            return;
        }
        if message.protocol != self.protocol {
            return;
        }
        if let Some(destination) = message.destination {
            if destination != self.id {
                return;
            }
        }
        match &message.storage_id {
            Some(id) if id != &self.storage_id => return,
            None => {
                warn!("{}", EndpointError::MissingStorageId);
                return;
            }
            Some(_) => {}
        }

        match message.kind {
            MessageKind::Response => self.resolve(message),
            MessageKind::Request => self.handle_request(message, handler),
            MessageKind::Notification => self.handle_notification(message, handler),
            MessageKind::Raft => {}
        }
    }

    fn handle_request(&self, message: &Message, handler: &dyn InboundHandler) {
        let op = match &message.payload {
            Payload::Strategy(op) => op,
            Payload::Raft(_) => return,
        };

        let response = match op {
            StrategyOp::GetEntriesRequest => Some(handler.on_get_entries_request(message.source, &message.keys)),
            StrategyOp::GetKeysRequest => Some(handler.on_get_keys_request(message.source)),
            StrategyOp::DeleteEntriesRequest => Some(handler.on_delete_entries_request(message.source, &message.keys)),
            StrategyOp::UpdateEntriesRequest => {
                Some(handler.on_update_entries_request(message.source, &message.keys, &message.values))
            }
            StrategyOp::FederatedGetRequest => Some(handler.on_federated_get_request(message.source, &message.keys)),
            StrategyOp::BackupGetRequest { owner } => Some(handler.on_backup_get_request(*owner)),
            _ => {
                warn!("{}", EndpointError::ProtocolMismatch);
                None
            }
        };

        if let Some(response) = response {
            let Some(correlation_id) = message.correlation_id else {
                warn!("request message missing a correlation id, cannot reply");
                return;
            };
            self.bus.publish(Message {
                protocol: self.protocol,
                kind: MessageKind::Response,
                source: self.id,
                destination: Some(message.source),
                correlation_id: Some(correlation_id),
                storage_id: Some(self.storage_id.clone()),
                keys: response.keys,
                values: response.values,
                sequence_number: None,
                term: None,
                payload: message.payload.clone(),
            });
        }
    }

    fn handle_notification(&self, message: &Message, handler: &dyn InboundHandler) {
        let op = match &message.payload {
            Payload::Strategy(op) => op,
            Payload::Raft(_) => return,
        };

        match op {
            StrategyOp::UpdateEntriesNotification => {
                handler.on_update_entries_notification(message.source, &message.keys, &message.values)
            }
            StrategyOp::DeleteEntriesNotification => {
                handler.on_delete_entries_notification(message.source, &message.keys)
            }
            StrategyOp::RemoteEndpointDetached => handler.on_remote_endpoint_detached(message.source),
            StrategyOp::FederatedSetNotification => {
                handler.on_federated_set_notification(message.source, &message.keys, &message.values)
            }
            StrategyOp::BackupSave { owner } => handler.on_backup_save(*owner, &message.keys, &message.values),
            StrategyOp::BackupDelete => handler.on_backup_delete(&message.keys),
            StrategyOp::BackupEvict => handler.on_backup_evict(&message.keys),
            _ => warn!("{}", EndpointError::ProtocolMismatch),
        }
    }

    fn resolve(&self, message: &Message) {
        let Some(correlation_id) = message.correlation_id else { return };
        let waiter = {
            let waiters = self.waiters.lock().expect("endpoint waiters poisoned");
            match waiters.get(&correlation_id) {
                Some(waiter) => Arc::clone(waiter),
                None => return,
            }
        };

        let mut state = waiter.state.lock().expect("waiter state poisoned");
        if state.done || !state.received.insert(message.source) {
            return;
        }
        for (key, value) in message.keys.iter().zip(message.values.iter()) {
            if state.merged.insert(key.clone(), value.clone()).is_some() {
                warn!("{}", OperationError::DuplicateKey);
                state.conflicts.push(key.clone());
            }
        }
        if state.received.len() >= state.expected.len() {
            state.done = true;
            waiter.condvar.notify_all();
        }
    }

    /// Satisfies any outstanding waiter's slot for `peer` with an empty response, so a request
    /// waiting on a peer that just detached resolves as soon as the rest of its expected
    /// responders answer instead of blocking for the full timeout.
    pub fn handle_peer_detached(&self, peer: EndpointId) {
        let waiters = self.waiters.lock().expect("endpoint waiters poisoned");
        for waiter in waiters.values() {
            let mut state = waiter.state.lock().expect("waiter state poisoned");
            if state.done || !state.expected.contains(&peer) || !state.received.insert(peer) {
                continue;
            }
            if state.received.len() >= state.expected.len() {
                state.done = true;
                waiter.condvar.notify_all();
            }
        }
    }

    /// Disposes every outstanding waiter with a cancelled result. Called when the owning
    /// storage closes so an in-flight `request()` doesn't keep blocking for its full timeout.
    pub fn close(&self) {
        let waiters = self.waiters.lock().expect("endpoint waiters poisoned");
        for waiter in waiters.values() {
            let mut state = waiter.state.lock().expect("waiter state poisoned");
            if !state.done {
                state.done = true;
                state.cancelled = true;
                waiter.condvar.notify_all();
            }
        }
    }

    /// Issues a correlated request to `destination`, splitting `keys`/`values` into
    /// `max-message-keys`/`max-message-values`-sized chunks as needed, and blocks until every
    /// expected responder answers or the request timeout elapses.
    pub fn request(
        &self,
        destination: Destination,
        op: StrategyOp,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
    ) -> Result<Aggregate, EndpointError> {
        let expected = match self.resolve_destination(destination) {
            Some(expected) => expected,
            None => return Ok(Aggregate::default()),
        };
        if expected.is_empty() {
            return Ok(Aggregate::default());
        }
        if keys.is_empty() && !op.is_parameterless() {
            return Ok(Aggregate::default());
        }
        if keys.is_empty() {
            return self.request_one(&expected, op, keys, values);
        }

        let mut merged: Map<Vec<u8>, Vec<u8>> = Map::new();
        let mut missing = std::collections::HashSet::new();
        let mut conflicts = Vec::new();

        for (key_chunk, value_chunk) in batch::chunks(keys, values, self.max_message_keys, self.max_message_values) {
            let outcome = self.request_one(&expected, op.clone(), key_chunk, value_chunk)?;
            for (k, v) in outcome.keys.into_iter().zip(outcome.values.into_iter()) {
                if merged.insert(k.clone(), v).is_some() {
                    warn!("{}", OperationError::DuplicateKey);
                    conflicts.push(k);
                }
            }
            missing.extend(outcome.missing);
            conflicts.extend(outcome.conflicts);
        }

        Ok(Aggregate {
            keys: merged.keys().cloned().collect(),
            values: merged.values().cloned().collect(),
            missing: missing.into_iter().collect(),
            conflicts,
        })
    }

    fn resolve_destination(&self, destination: Destination) -> Option<Vec<EndpointId>> {
        match destination {
            Destination::Unicast(id) => Some(vec![id]),
            Destination::Broadcast => Some(self.membership.remote_ids()),
            Destination::Leader => self.membership.current_leader().map(|leader| vec![leader]),
        }
    }

    fn request_one(
        &self,
        expected: &[EndpointId],
        op: StrategyOp,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
    ) -> Result<Aggregate, EndpointError> {
        let correlation_id = CorrelationId::new();
        let waiter = Arc::new(Waiter {
            state: Mutex::new(WaiterState {
                expected: expected.to_vec(),
                received: std::collections::HashSet::new(),
                merged: Map::new(),
                conflicts: Vec::new(),
                done: false,
                cancelled: false,
            }),
            condvar: Condvar::new(),
        });
        self.waiters.lock().expect("endpoint waiters poisoned").insert(correlation_id, Arc::clone(&waiter));

        let destination = if expected.len() == 1 { Some(expected[0]) } else { None };
        self.bus.publish(Message {
            protocol: self.protocol,
            kind: MessageKind::Request,
            source: self.id,
            destination,
            correlation_id: Some(correlation_id),
            storage_id: Some(self.storage_id.clone()),
            keys: keys.to_vec(),
            values: values.to_vec(),
            sequence_number: None,
            term: None,
            payload: Payload::Strategy(op),
        });

        let result = self.await_waiter(&waiter, expected);
        self.waiters.lock().expect("endpoint waiters poisoned").remove(&correlation_id);
        result
    }

    fn await_waiter(&self, waiter: &Waiter, expected: &[EndpointId]) -> Result<Aggregate, EndpointError> {
        let guard = waiter.state.lock().expect("waiter state poisoned");
        let (state, timed_out) = waiter
            .condvar
            .wait_timeout_while(guard, self.request_timeout, |state| !state.done)
            .expect("waiter state poisoned");

        if state.cancelled {
            return Err(EndpointError::Cancelled);
        }

        let missing: Vec<EndpointId> = expected.iter().filter(|id| !state.received.contains(id)).copied().collect();
        let aggregate = Aggregate {
            keys: state.merged.keys().cloned().collect(),
            values: state.merged.values().cloned().collect(),
            missing: missing.clone(),
            conflicts: state.conflicts.clone(),
        };

        if timed_out.timed_out() && !missing.is_empty() {
            return Err(EndpointError::Timeout { missing });
        }
        Ok(aggregate)
    }

    /// Publishes a fire-and-forget notification; does not register a waiter.
    pub fn notify(&self, destination: Destination, op: StrategyOp, keys: &[Vec<u8>], values: &[Vec<u8>]) {
        let Some(expected) = self.resolve_destination(destination) else { return };
        if keys.is_empty() && values.is_empty() && !matches!(op, StrategyOp::RemoteEndpointDetached) {
            return;
        }

        let unicast = if expected.len() == 1 { Some(expected[0]) } else { None };
        self.bus.publish(Message {
            protocol: self.protocol,
            kind: MessageKind::Notification,
            source: self.id,
            destination: unicast,
            correlation_id: None,
            storage_id: Some(self.storage_id.clone()),
            keys: keys.to_vec(),
            values: values.to_vec(),
            sequence_number: None,
            term: None,
            payload: Payload::Strategy(op),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;

    struct FixedMembership {
        local: EndpointId,
        remotes: Vec<EndpointId>,
        leader: Option<EndpointId>,
    }

    impl Membership for FixedMembership {
        fn local_id(&self) -> EndpointId {
            self.local
        }

        fn remote_ids(&self) -> Vec<EndpointId> {
            self.remotes.clone()
        }

        fn current_leader(&self) -> Option<EndpointId> {
            self.leader
        }
    }

    struct EchoHandler;

    impl InboundHandler for EchoHandler {
        fn on_get_entries_request(&self, _from: EndpointId, keys: &[Vec<u8>]) -> ResponseData {
            ResponseData {
                keys: keys.to_vec(),
                values: keys.iter().map(|k| k.clone()).collect(),
            }
        }
    }

    fn echo_endpoint(bus: Arc<dyn MessageBus>, membership: Arc<dyn Membership>, storage_id: &str) -> Arc<Endpoint> {
        let endpoint = Endpoint::new(
            Protocol::Separated,
            storage_id.to_string(),
            bus,
            membership,
            1_000,
            1_000,
            Duration::from_millis(200),
        );
        endpoint.spawn_dispatch(Arc::new(EchoHandler));
        endpoint
    }

    #[test]
    fn zero_keys_resolve_immediately_without_publishing() {
        let bus = Arc::new(InProcessBus::new());
        let receiver = bus.subscribe();
        let membership = Arc::new(FixedMembership { local: EndpointId::new(), remotes: vec![], leader: None });
        let endpoint = Endpoint::new(
            Protocol::Separated,
            "s".to_string(),
            bus.clone() as Arc<dyn MessageBus>,
            membership,
            10,
            10,
            Duration::from_millis(50),
        );

        let result = endpoint.request(Destination::Broadcast, StrategyOp::GetEntriesRequest, &[], &[]).unwrap();
        assert!(result.keys.is_empty());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn broadcast_request_is_answered_and_merged() {
        let bus = Arc::new(InProcessBus::new());
        let local = EndpointId::new();
        let remote = EndpointId::new();

        let remote_membership = Arc::new(FixedMembership { local: remote, remotes: vec![local], leader: None });
        let _remote_endpoint = echo_endpoint(bus.clone() as Arc<dyn MessageBus>, remote_membership, "s");

        let local_membership = Arc::new(FixedMembership { local, remotes: vec![remote], leader: None });
        let local_endpoint = Endpoint::new(
            Protocol::Separated,
            "s".to_string(),
            bus as Arc<dyn MessageBus>,
            local_membership,
            1_000,
            1_000,
            Duration::from_millis(500),
        );

        let result = local_endpoint
            .request(Destination::Broadcast, StrategyOp::GetEntriesRequest, &[vec![1], vec![2]], &[])
            .unwrap();
        assert!(result.missing.is_empty());
        assert_eq!(result.keys.len(), 2);
    }

    #[test]
    fn unanswered_destination_times_out_with_partial_result() {
        let bus = Arc::new(InProcessBus::new());
        let local = EndpointId::new();
        let silent_remote = EndpointId::new();

        let membership = Arc::new(FixedMembership { local, remotes: vec![silent_remote], leader: None });
        let endpoint = Endpoint::new(
            Protocol::Separated,
            "s".to_string(),
            bus as Arc<dyn MessageBus>,
            membership,
            10,
            10,
            Duration::from_millis(30),
        );

        let result = endpoint.request(Destination::Broadcast, StrategyOp::GetEntriesRequest, &[vec![1]], &[]);
        match result {
            Err(EndpointError::Timeout { missing }) => assert_eq!(missing, vec![silent_remote]),
            other => panic!("expected timeout, got {:?}", other.map(|a| a.keys)),
        }
    }

    #[test]
    fn leader_directed_with_no_known_leader_resolves_empty() {
        let bus = Arc::new(InProcessBus::new());
        let membership = Arc::new(FixedMembership { local: EndpointId::new(), remotes: vec![], leader: None });
        let endpoint = Endpoint::new(
            Protocol::Replicated,
            "s".to_string(),
            bus as Arc<dyn MessageBus>,
            membership,
            10,
            10,
            Duration::from_millis(50),
        );

        let result = endpoint.request(Destination::Leader, StrategyOp::UpdateEntriesRequest, &[vec![1]], &[vec![2]]).unwrap();
        assert!(result.keys.is_empty());
    }

    #[test]
    fn detaching_the_only_silent_peer_resolves_the_request_immediately() {
        let bus = Arc::new(InProcessBus::new());
        let local = EndpointId::new();
        let silent_remote = EndpointId::new();

        let membership = Arc::new(FixedMembership { local, remotes: vec![silent_remote], leader: None });
        let endpoint = Endpoint::new(
            Protocol::Separated,
            "s".to_string(),
            bus as Arc<dyn MessageBus>,
            membership,
            10,
            10,
            Duration::from_secs(30),
        );

        let endpoint_for_detach = Arc::clone(&endpoint);
        let detacher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            endpoint_for_detach.handle_peer_detached(silent_remote);
        });

        let start = std::time::Instant::now();
        let result = endpoint.request(Destination::Broadcast, StrategyOp::GetEntriesRequest, &[vec![1]], &[]).unwrap();
        detacher.join().unwrap();

        assert!(result.missing.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5), "request should resolve as soon as the only peer detaches");
    }

    #[test]
    fn closing_cancels_an_outstanding_request() {
        let bus = Arc::new(InProcessBus::new());
        let membership = Arc::new(FixedMembership { local: EndpointId::new(), remotes: vec![EndpointId::new()], leader: None });
        let endpoint = Endpoint::new(
            Protocol::Separated,
            "s".to_string(),
            bus as Arc<dyn MessageBus>,
            membership,
            10,
            10,
            Duration::from_secs(30),
        );

        let endpoint_for_close = Arc::clone(&endpoint);
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            endpoint_for_close.close();
        });

        let result = endpoint.request(Destination::Broadcast, StrategyOp::GetEntriesRequest, &[vec![1]], &[]);
        closer.join().unwrap();

        assert!(matches!(result, Err(EndpointError::Cancelled)));
    }
}
