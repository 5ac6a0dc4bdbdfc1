//! # Connections Module
//!
//! The three external collaborators of the relay, expressed as object-safe
//! async traits and shared as `Arc<dyn Trait>`:
//!
//! - **`Directory`**: subscriber records, queried with a `MatchFilter`.
//! - **`Transport`**: named queues with at-least-once receive semantics.
//! - **`ConfigSource`**: the persisted `(field_name, field_value)` entries.
//!
//! `memory` holds process-local implementations used when no Redis URL is
//! configured and throughout the tests. `redis_store` (feature `connections`)
//! backs all three with a single Redis instance.

use crate::configs::ConfigEntry;
use crate::core::matcher::MatchFilter;
use crate::error::RelayResult;
use crate::model::{OutboundEnvelope, QueueRef, ReceivedMessage, SubscriberRecord};
use async_trait::async_trait;
use std::time::Duration;

/// Process-local collaborators.
pub mod memory;

/// Redis-backed collaborators.
#[cfg(feature = "connections")]
pub mod redis_store;

pub use memory::{MemoryConfigSource, MemoryDirectory, MemoryTransport};
#[cfg(feature = "connections")]
pub use redis_store::{RedisConfigSource, RedisDirectory, RedisStore, RedisTransport};

/// Store of subscriber records keyed by id.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Records that may satisfy `filter`. Implementations may return a superset;
    /// the matcher re-applies the filter.
    async fn scan(&self, filter: &MatchFilter) -> RelayResult<Vec<SubscriberRecord>>;

    async fn get(&self, id: &str) -> RelayResult<Option<SubscriberRecord>>;

    /// Conditional create; `AlreadyExists` if the id is taken.
    async fn put_new(&self, record: SubscriberRecord) -> RelayResult<()>;

    /// Whole-record replace; `NotFound` if the id is absent.
    async fn update(&self, record: SubscriberRecord) -> RelayResult<()>;

    /// Idempotent removal.
    async fn delete(&self, id: &str) -> RelayResult<()>;

    async fn list(&self) -> RelayResult<Vec<SubscriberRecord>>;
}

/// Queueing substrate.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Creates a queue; `AlreadyExists` if the name is taken.
    async fn create_queue(&self, name: &str) -> RelayResult<QueueRef>;

    /// Creates the queue if it is missing and returns its reference either way.
    async fn ensure_queue(&self, name: &str) -> RelayResult<QueueRef>;

    /// `NotFound` if the queue does not exist.
    async fn delete_queue(&self, queue: &QueueRef) -> RelayResult<()>;

    async fn send(&self, queue: &QueueRef, message: OutboundEnvelope) -> RelayResult<()>;

    /// Waits up to `wait` for at least one message and returns at most `max`.
    /// Returned messages stay invisible until deleted or until their
    /// visibility timeout expires.
    async fn receive(&self, queue: &QueueRef, max: usize, wait: Duration) -> RelayResult<Vec<ReceivedMessage>>;

    async fn delete_message(&self, queue: &QueueRef, receipt_handle: &str) -> RelayResult<()>;
}

/// Persisted dynamic configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn entries(&self) -> RelayResult<Vec<ConfigEntry>>;

    /// Conditional update; `NotFound` if the field has never been stored.
    async fn update_entry(&self, field_name: &str, field_value: &str) -> RelayResult<()>;

    /// Stores entries that are not present yet, leaving existing ones untouched.
    async fn insert_default(&self, entries: &[ConfigEntry]) -> RelayResult<()>;
}
