//! Identifiers used throughout the grid.

use std::fmt;

use uuid::Uuid;

/// A 128-bit value identifying one participant in the grid for the lifetime of its process.
///
/// Two peers never share an identifier; restarting a peer yields a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Generates a fresh, random endpoint identifier.
    pub fn new() -> Self {
        EndpointId(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An operator-chosen name identifying a logical storage. Peers that use the same storage id
/// form one storage and must agree on its strategy, key type, and value type.
pub type StorageId = String;
