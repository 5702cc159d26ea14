//! The [`Message`] envelope that crosses the message bus, and the payload types nested
//! inside it for each protocol.

use std::fmt;

use uuid::Uuid;

use crate::ids::{EndpointId, StorageId};

/// Identifies one outbound request so its responses can be correlated back to the waiter
/// that issued it. Unique within the issuing endpoint's process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The protocol tag on a [`Message`], used to route it to the right inbound handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Separated,
    Replicated,
    Federated,
    Backup,
    Raft,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Separated => "separated-storage",
            Protocol::Replicated => "replicated-storage",
            Protocol::Federated => "federated-storage",
            Protocol::Backup => "backup-storage",
            Protocol::Raft => "raft",
        };
        f.write_str(name)
    }
}

/// The broad class of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Raft,
}

/// The specific operation a strategy or backup-storage message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOp {
    GetEntriesRequest,
    GetEntriesResponse,
    GetKeysRequest,
    GetKeysResponse,
    DeleteEntriesRequest,
    DeleteEntriesResponse,
    UpdateEntriesNotification,
    UpdateEntriesRequest,
    UpdateEntriesResponse,
    DeleteEntriesNotification,
    RemoteEndpointDetached,
    FederatedSetNotification,
    FederatedGetRequest,
    FederatedGetResponse,
    BackupSave { owner: EndpointId },
    BackupDelete,
    BackupEvict,
    BackupGetRequest { owner: EndpointId },
    BackupGetResponse,
}

impl StrategyOp {
    /// Whether this op legitimately carries no keys (e.g. "list everything"), as opposed to
    /// an ordinary keyed request that happens to have been called with an empty key list.
    pub fn is_parameterless(&self) -> bool {
        matches!(self, StrategyOp::GetKeysRequest | StrategyOp::BackupGetRequest { .. })
    }
}

/// A single Raft log entry as carried over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireLogEntry {
    pub term: u64,
    pub data: Vec<u8>,
}

/// The Raft remote procedure call carried by a [`Message`] tagged [`Protocol::Raft`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftRpc {
    VoteRequest {
        last_log_idx: u64,
        last_log_term: u64,
    },
    VoteResponse {
        vote_granted: bool,
    },
    AppendRequest {
        prev_log_idx: u64,
        prev_log_term: u64,
        leader_commit: u64,
        entries: Vec<WireLogEntry>,
    },
    AppendResponse {
        success: bool,
        match_idx: u64,
        last_log_idx: u64,
    },
}

/// The payload-specific part of a [`Message`], kept as a sum type so a raft term can never
/// be attached to, say, a backup-save notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Strategy(StrategyOp),
    Raft(RaftRpc),
}

/// The unit crossing the message bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol: Protocol,
    pub kind: MessageKind,
    pub source: EndpointId,
    /// `None` means broadcast to all current remote endpoints.
    pub destination: Option<EndpointId>,
    pub correlation_id: Option<CorrelationId>,
    pub storage_id: Option<StorageId>,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub sequence_number: Option<u64>,
    pub term: Option<u64>,
    pub payload: Payload,
}

impl Message {
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }
}
