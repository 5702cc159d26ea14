//! Error types for the grid: one small `enum ...Error` per concern, each with a hand-written
//! `Display`/`std::error::Error` impl rather than a single catch-all boxed error.

use std::fmt;

use crate::ids::EndpointId;

/// A *fatal* error: refuses to build a [`Grid`](crate::grid::Grid) or storage at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    MissingStorageId,
    MissingMergeOperator,
    ZeroTimeout,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::MissingStorageId => write!(f, "storage-id is required"),
            BuildError::MissingMergeOperator => {
                write!(f, "federated storage requires a merge-operator")
            }
            BuildError::ZeroTimeout => write!(f, "request-timeout-ms must be greater than zero"),
        }
    }
}

impl std::error::Error for BuildError {}

/// A *transient* error surfaced from an endpoint request. Never terminates the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The request's deadline elapsed before every expected responder answered.
    Timeout {
        /// Endpoints that had not yet answered when the deadline elapsed.
        missing: Vec<EndpointId>,
    },
    /// An inbound message referenced a storage id the endpoint doesn't recognize.
    MissingStorageId,
    /// An inbound message carried an operation that doesn't belong to this protocol.
    ProtocolMismatch,
    /// The owning storage closed while this request was still outstanding.
    Cancelled,
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::Timeout { missing } => {
                write!(f, "request timed out, {} peer(s) did not answer", missing.len())
            }
            EndpointError::MissingStorageId => write!(f, "inbound message is missing a storage id"),
            EndpointError::ProtocolMismatch => write!(f, "inbound message has an unexpected protocol tag"),
            EndpointError::Cancelled => write!(f, "request cancelled because the storage closed"),
        }
    }
}

impl std::error::Error for EndpointError {}

/// A *logical* error: a failed operation that does not poison the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Attempted to restore a key the store already has.
    AlreadyPresent,
    /// Two responders answered a single request with the same key; the later one won,
    /// consistent with last-writer-wins batching.
    DuplicateKey,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::AlreadyPresent => write!(f, "key already present, restore refused"),
            OperationError::DuplicateKey => write!(f, "duplicate key observed while merging responses"),
        }
    }
}

impl std::error::Error for OperationError {}

/// A *backup-storage* error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    NoLivePeers,
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::NoLivePeers => write!(f, "no live peer available to hold a backup"),
        }
    }
}

impl std::error::Error for BackupError {}
