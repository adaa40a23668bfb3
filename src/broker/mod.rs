//! Broker abstraction — the key/value and append-only stream primitives the
//! message bus and conversation store are built on.
//!
//! Two backends:
//! - `RedisBroker` — production, one multiplexed connection shared by every caller
//! - `MemoryBroker` — in-process, for tests and local CLI runs

#[cfg(test)]
mod flaky;
mod memory;
mod redis_backend;

#[cfg(test)]
pub use flaky::FlakyBroker;
pub use memory::MemoryBroker;
pub use redis_backend::RedisBroker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

/// Stream position that precedes every entry.
pub const STREAM_START: &str = "0-0";

/// A single stream entry as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Broker-assigned entry ID (`<millis>-<seq>`).
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Backend-agnostic broker trait.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append an entry to a stream, trimming it to roughly `max_len` entries
    /// and refreshing the stream's TTL. Returns the new entry ID.
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: usize,
        ttl: Duration,
    ) -> Result<String, BrokerError>;

    /// Read up to `count` entries strictly after `after_id`, oldest first.
    /// A missing stream reads as empty.
    async fn read_after(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Set a string key with a TTL, overwriting any previous value.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Get a string key.
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Delete keys of any type. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), BrokerError>;
}
