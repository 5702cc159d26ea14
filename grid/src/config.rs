//! Configuration for a storage and for the grid's Raft coordinator, built through explicit
//! builder types that validate required fields at `build()` time rather than a single
//! struct with scattered optional fields.

use std::time::Duration;

use crate::error::BuildError;
use crate::ids::StorageId;

/// Per-storage configuration, shared by all three distribution strategies.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub storage_id: StorageId,
    pub max_message_keys: usize,
    pub max_message_values: usize,
    pub request_timeout_ms: u64,
    pub max_collected_events: usize,
    pub max_collected_time_ms: u64,
    pub iterator_batch_size: usize,
}

impl StorageConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_collected_time(&self) -> Duration {
        Duration::from_millis(self.max_collected_time_ms)
    }
}

/// Builds a [`StorageConfig`], refusing (a [`BuildError`]) rather than defaulting silently
/// when a required field is missing.
pub struct StorageConfigBuilder {
    storage_id: Option<StorageId>,
    max_message_keys: usize,
    max_message_values: usize,
    request_timeout_ms: u64,
    max_collected_events: usize,
    max_collected_time_ms: u64,
    iterator_batch_size: usize,
}

impl StorageConfigBuilder {
    pub fn new() -> Self {
        StorageConfigBuilder {
            storage_id: None,
            max_message_keys: 1_000,
            max_message_values: 1_000,
            request_timeout_ms: 5_000,
            max_collected_events: 100,
            max_collected_time_ms: 250,
            iterator_batch_size: 500,
        }
    }

    pub fn storage_id<T: Into<StorageId>>(mut self, storage_id: T) -> Self {
        self.storage_id = Some(storage_id.into());
        self
    }

    pub fn max_message_keys(mut self, value: usize) -> Self {
        self.max_message_keys = value;
        self
    }

    pub fn max_message_values(mut self, value: usize) -> Self {
        self.max_message_values = value;
        self
    }

    pub fn request_timeout_ms(mut self, value: u64) -> Self {
        self.request_timeout_ms = value;
        self
    }

    pub fn max_collected_events(mut self, value: usize) -> Self {
        self.max_collected_events = value;
        self
    }

    pub fn max_collected_time_ms(mut self, value: u64) -> Self {
        self.max_collected_time_ms = value;
        self
    }

    pub fn iterator_batch_size(mut self, value: usize) -> Self {
        self.iterator_batch_size = value;
        self
    }

    pub fn build(self) -> Result<StorageConfig, BuildError> {
        let storage_id = self.storage_id.ok_or(BuildError::MissingStorageId)?;
        if self.request_timeout_ms == 0 {
            return Err(BuildError::ZeroTimeout);
        }

        Ok(StorageConfig {
            storage_id,
            max_message_keys: self.max_message_keys,
            max_message_values: self.max_message_values,
            request_timeout_ms: self.request_timeout_ms,
            max_collected_events: self.max_collected_events,
            max_collected_time_ms: self.max_collected_time_ms,
            iterator_batch_size: self.iterator_batch_size,
        })
    }
}

impl Default for StorageConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cluster-wide Raft tuning, shared by every storage on a [`Grid`](crate::grid::Grid).
#[derive(Debug, Clone, Copy)]
pub struct RaftConfig {
    pub min_election_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub peer_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            min_election_timeout_ms: 150,
            heartbeat_ms: 50,
            peer_timeout_ms: 1_000,
        }
    }
}

impl RaftConfig {
    pub fn min_election_timeout(&self) -> Duration {
        Duration::from_millis(self.min_election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}
