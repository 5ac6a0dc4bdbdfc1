//! # In-Memory Collaborators
//!
//! Mutex-guarded, process-local stand-ins for the directory, the queueing
//! substrate and the configuration store. The server runs on them when no
//! Redis URL is configured; the tests use them as fixtures.

use super::{ConfigSource, Directory, Transport};
use crate::configs::ConfigEntry;
use crate::core::matcher::MatchFilter;
use crate::error::{RelayError, RelayResult};
use crate::model::{Envelope, OutboundEnvelope, QueueRef, ReceivedMessage, SubscriberRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const QUEUE_SCHEME: &str = "memory://";
const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);
const DEDUP_WINDOW: Duration = Duration::from_secs(300);
/// Longest single sleep inside a long poll, so expired in-flight messages are
/// picked up without a send to wake the waiter.
const POLL_SLICE: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Directory ---

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    records: Mutex<BTreeMap<String, SubscriberRecord>>,
}

impl MemoryDirectory {
    /// Unconditional upsert, for seeding.
    pub fn insert(&self, record: SubscriberRecord) {
        lock(&self.records).insert(record.id.clone(), record);
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn scan(&self, filter: &MatchFilter) -> RelayResult<Vec<SubscriberRecord>> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> RelayResult<Option<SubscriberRecord>> {
        Ok(lock(&self.records).get(id).cloned())
    }

    async fn put_new(&self, record: SubscriberRecord) -> RelayResult<()> {
        let mut records = lock(&self.records);
        if records.contains_key(&record.id) {
            return Err(RelayError::AlreadyExists(format!("subscriber {}", record.id)));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, record: SubscriberRecord) -> RelayResult<()> {
        let mut records = lock(&self.records);
        match records.get_mut(&record.id) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(RelayError::NotFound(format!("subscriber {}", record.id))),
        }
    }

    async fn delete(&self, id: &str) -> RelayResult<()> {
        lock(&self.records).remove(id);
        Ok(())
    }

    async fn list(&self) -> RelayResult<Vec<SubscriberRecord>> {
        Ok(lock(&self.records).values().cloned().collect())
    }
}

// --- Transport ---

#[derive(Debug)]
struct InFlight {
    envelope: Envelope,
    visible_at: Instant,
    /// Receipt sequence, so redelivery keeps the original order.
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<String, InFlight>,
    dedup: HashMap<String, Instant>,
}

impl QueueState {
    /// Moves messages whose visibility timeout elapsed back to the front,
    /// oldest receipt first.
    fn restore_expired(&mut self, now: Instant) {
        let mut expired: Vec<(u64, String)> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(receipt, m)| (m.seq, receipt.clone()))
            .collect();
        expired.sort_unstable();
        for (_, receipt) in expired.into_iter().rev() {
            if let Some(message) = self.in_flight.remove(&receipt) {
                self.ready.push_front(message.envelope);
            }
        }
    }
}

/// Queues with a ready list, in-flight messages pending acknowledgement and
/// a best-effort dedup window keyed by dedup token.
#[derive(Debug)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<QueueRef, QueueState>>,
    arrivals: Notify,
    receipts: AtomicU64,
    visibility_timeout: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY)
    }
}

impl MemoryTransport {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
            receipts: AtomicU64::new(0),
            visibility_timeout,
        }
    }

    pub fn has_queue(&self, queue: &QueueRef) -> bool {
        lock(&self.queues).contains_key(queue)
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.queues).len()
    }

    /// Messages visible to the next receive.
    pub fn pending(&self, queue: &QueueRef) -> usize {
        lock(&self.queues).get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages received but not yet deleted.
    pub fn in_flight(&self, queue: &QueueRef) -> usize {
        lock(&self.queues).get(queue).map_or(0, |q| q.in_flight.len())
    }

    fn missing(queue: &QueueRef) -> RelayError {
        RelayError::NotFound(format!("queue {}", queue))
    }

    fn take_ready(&self, queue: &QueueRef, max: usize) -> RelayResult<Vec<ReceivedMessage>> {
        let mut queues = lock(&self.queues);
        let state = queues.get_mut(queue).ok_or_else(|| Self::missing(queue))?;
        let now = Instant::now();
        state.restore_expired(now);

        let mut out = Vec::new();
        while out.len() < max {
            let Some(envelope) = state.ready.pop_front() else { break };
            let seq = self.receipts.fetch_add(1, Ordering::Relaxed);
            let receipt = format!("rcpt-{}", seq);
            state.in_flight.insert(
                receipt.clone(),
                InFlight { envelope: envelope.clone(), visible_at: now + self.visibility_timeout, seq },
            );
            out.push(ReceivedMessage { receipt_handle: receipt, envelope });
        }
        Ok(out)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_queue(&self, name: &str) -> RelayResult<QueueRef> {
        let queue = QueueRef::new(format!("{}{}", QUEUE_SCHEME, name));
        let mut queues = lock(&self.queues);
        if queues.contains_key(&queue) {
            return Err(RelayError::AlreadyExists(format!("queue {}", name)));
        }
        queues.insert(queue.clone(), QueueState::default());
        Ok(queue)
    }

    async fn ensure_queue(&self, name: &str) -> RelayResult<QueueRef> {
        let queue = QueueRef::new(format!("{}{}", QUEUE_SCHEME, name));
        lock(&self.queues).entry(queue.clone()).or_default();
        Ok(queue)
    }

    async fn delete_queue(&self, queue: &QueueRef) -> RelayResult<()> {
        lock(&self.queues)
            .remove(queue)
            .map(|_| ())
            .ok_or_else(|| Self::missing(queue))
    }

    async fn send(&self, queue: &QueueRef, message: OutboundEnvelope) -> RelayResult<()> {
        {
            let mut queues = lock(&self.queues);
            let state = queues.get_mut(queue).ok_or_else(|| Self::missing(queue))?;
            let now = Instant::now();
            state.dedup.retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
            if state.dedup.contains_key(&message.dedup_token) {
                log::debug!("Suppressed duplicate send {} on {}", message.dedup_token, queue);
                return Ok(());
            }
            state.dedup.insert(message.dedup_token, now);
            state.ready.push_back(message.envelope);
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &QueueRef, max: usize, wait: Duration) -> RelayResult<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let arrival = self.arrivals.notified();
            let messages = self.take_ready(queue, max)?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(messages);
            }
            let slice = (deadline - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(slice, arrival).await;
        }
    }

    async fn delete_message(&self, queue: &QueueRef, receipt_handle: &str) -> RelayResult<()> {
        let mut queues = lock(&self.queues);
        let state = queues.get_mut(queue).ok_or_else(|| Self::missing(queue))?;
        if state.in_flight.remove(receipt_handle).is_none() {
            log::debug!("Receipt {} on {} is no longer in flight", receipt_handle, queue);
        }
        Ok(())
    }
}

// --- Config source ---

#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigSource {
    pub fn new(entries: &[ConfigEntry]) -> Self {
        let map = entries
            .iter()
            .map(|e| (e.field_name.clone(), e.field_value.clone()))
            .collect();
        Self { entries: Mutex::new(map) }
    }

    /// Unconditional write, for tests that need to plant bad values.
    pub fn set(&self, field_name: &str, field_value: &str) {
        lock(&self.entries).insert(field_name.to_string(), field_value.to_string());
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn entries(&self) -> RelayResult<Vec<ConfigEntry>> {
        Ok(lock(&self.entries)
            .iter()
            .map(|(name, value)| ConfigEntry::new(name, value))
            .collect())
    }

    async fn update_entry(&self, field_name: &str, field_value: &str) -> RelayResult<()> {
        let mut entries = lock(&self.entries);
        match entries.get_mut(field_name) {
            Some(value) => {
                *value = field_value.to_string();
                Ok(())
            }
            None => Err(RelayError::NotFound(format!("configuration field {}", field_name))),
        }
    }

    async fn insert_default(&self, defaults: &[ConfigEntry]) -> RelayResult<()> {
        let mut entries = lock(&self.entries);
        for entry in defaults {
            entries
                .entry(entry.field_name.clone())
                .or_insert_with(|| entry.field_value.clone());
        }
        Ok(())
    }
}
