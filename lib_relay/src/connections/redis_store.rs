//! # Redis Collaborators
//!
//! Directory, transport and configuration source backed by one Redis
//! instance, sharing a tokio `ConnectionManager`. Blocking receives run on a
//! second manager without a response timeout.
//!
//! ## Key layout
//!
//! | key                                  | type   | content                              |
//! |--------------------------------------|--------|--------------------------------------|
//! | `relay:subscribers`                  | set    | subscriber ids                       |
//! | `relay:subscriber:<id>`              | string | JSON `SubscriberRecord`              |
//! | `relay:configuration`                | hash   | `field_name -> field_value`          |
//! | `relay:queues`                       | set    | existing queue keys                  |
//! | `relay:queue:<name>`                 | list   | ready messages (JSON documents)      |
//! | `relay:queue:<name>:inflight`        | list   | received, not yet deleted            |
//! | `relay:queue:<name>:deadlines`       | zset   | in-flight payload -> visible-at (ms) |
//! | `relay:dedup:<token>`                | string | dedup marker with expiry             |

use super::{ConfigSource, Directory, Transport};
use crate::configs::ConfigEntry;
use crate::core::matcher::MatchFilter;
use crate::error::{RelayError, RelayResult};
use crate::model::{Envelope, OutboundEnvelope, QueueRef, ReceivedMessage, SubscriberRecord};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

const SUBSCRIBER_INDEX: &str = "relay:subscribers";
const SUBSCRIBER_PREFIX: &str = "relay:subscriber:";
const CONFIG_HASH: &str = "relay:configuration";
const QUEUE_REGISTRY: &str = "relay:queues";
const QUEUE_PREFIX: &str = "relay:queue:";
const DEDUP_PREFIX: &str = "relay:dedup:";
const DEDUP_TTL_SECS: u64 = 300;

fn subscriber_key(id: &str) -> String {
    format!("{}{}", SUBSCRIBER_PREFIX, id)
}

fn inflight_key(queue: &QueueRef) -> String {
    format!("{}:inflight", queue)
}

fn deadlines_key(queue: &QueueRef) -> String {
    format!("{}:deadlines", queue)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Shared connection handle. Construct once, then hand out the three adapters.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    blocking: ConnectionManager,
}

impl RedisStore {
    /// Opens the client and the managed connection.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> RelayResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        // BLMOVE answers only when its own wait elapses, so no client-side deadline.
        let blocking =
            ConnectionManager::new_with_config(client, ConnectionManagerConfig::new().set_response_timeout(None))
                .await?;
        log::info!("Connected to Redis at {}", url);
        Ok(Self { conn, blocking })
    }

    pub fn directory(&self) -> RedisDirectory {
        RedisDirectory { conn: self.conn.clone() }
    }

    pub fn transport(&self, visibility_timeout: Duration) -> RedisTransport {
        RedisTransport {
            conn: self.conn.clone(),
            blocking: self.blocking.clone(),
            visibility_timeout,
        }
    }

    pub fn config_source(&self) -> RedisConfigSource {
        RedisConfigSource { conn: self.conn.clone() }
    }
}

// --- Directory ---

pub struct RedisDirectory {
    conn: ConnectionManager,
}

impl RedisDirectory {
    async fn fetch_all(&self) -> RelayResult<Vec<SubscriberRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS").arg(SUBSCRIBER_INDEX).query_async(&mut conn).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| subscriber_key(id)).collect();
        let docs: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut records = Vec::with_capacity(docs.len());
        for doc in docs.into_iter().flatten() {
            match serde_json::from_str::<SubscriberRecord>(&doc) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable subscriber document: {}", e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn scan(&self, filter: &MatchFilter) -> RelayResult<Vec<SubscriberRecord>> {
        Ok(self.fetch_all().await?.into_iter().filter(|r| filter.matches(r)).collect())
    }

    async fn get(&self, id: &str) -> RelayResult<Option<SubscriberRecord>> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = redis::cmd("GET").arg(subscriber_key(id)).query_async(&mut conn).await?;
        doc.map(|d| serde_json::from_str(&d).map_err(RelayError::from)).transpose()
    }

    async fn put_new(&self, record: SubscriberRecord) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        let doc = serde_json::to_string(&record)?;
        let created: Option<String> = redis::cmd("SET")
            .arg(subscriber_key(&record.id))
            .arg(doc)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if created.is_none() {
            return Err(RelayError::AlreadyExists(format!("subscriber {}", record.id)));
        }
        let _: i64 = redis::cmd("SADD").arg(SUBSCRIBER_INDEX).arg(&record.id).query_async(&mut conn).await?;
        Ok(())
    }

    async fn update(&self, record: SubscriberRecord) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        let doc = serde_json::to_string(&record)?;
        let replaced: Option<String> = redis::cmd("SET")
            .arg(subscriber_key(&record.id))
            .arg(doc)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        replaced
            .map(|_| ())
            .ok_or_else(|| RelayError::NotFound(format!("subscriber {}", record.id)))
    }

    async fn delete(&self, id: &str) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(subscriber_key(id)).query_async(&mut conn).await?;
        let _: i64 = redis::cmd("SREM").arg(SUBSCRIBER_INDEX).arg(id).query_async(&mut conn).await?;
        Ok(())
    }

    async fn list(&self) -> RelayResult<Vec<SubscriberRecord>> {
        self.fetch_all().await
    }
}

// --- Transport ---

/// What is actually stored in the queue lists. The message id makes every
/// payload unique, so the payload itself serves as receipt handle.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMessage {
    message_id: String,
    group_key: String,
    envelope: Envelope,
}

/// One restore pass over a queue's in-flight list.
#[derive(Debug, Default, PartialEq, Eq)]
struct RestorePlan {
    /// Expired payloads, oldest receipt first.
    requeue: Vec<String>,
    /// In flight without a deadline: moved by a receive that never got to
    /// record one.
    adopt: Vec<String>,
    /// Deadlines left behind by payloads that are no longer in flight.
    forget: Vec<String>,
}

fn plan_restore(inflight: &[String], deadlines: &HashMap<String, i64>, now: i64) -> RestorePlan {
    let mut plan = RestorePlan::default();
    for payload in inflight {
        match deadlines.get(payload) {
            Some(visible_at) if *visible_at <= now => plan.requeue.push(payload.clone()),
            Some(_) => {}
            None => plan.adopt.push(payload.clone()),
        }
    }
    plan.forget = deadlines
        .keys()
        .filter(|payload| !inflight.contains(*payload))
        .cloned()
        .collect();
    plan
}

pub struct RedisTransport {
    conn: ConnectionManager,
    blocking: ConnectionManager,
    visibility_timeout: Duration,
}

impl RedisTransport {
    async fn exists(&self, queue: &QueueRef) -> RelayResult<bool> {
        let mut conn = self.conn.clone();
        let member: bool = redis::cmd("SISMEMBER")
            .arg(QUEUE_REGISTRY)
            .arg(queue.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(member)
    }

    async fn require(&self, queue: &QueueRef) -> RelayResult<()> {
        if self.exists(queue).await? {
            Ok(())
        } else {
            Err(RelayError::NotFound(format!("queue {}", queue)))
        }
    }

    /// Puts in-flight messages whose visibility timeout elapsed back at the
    /// head in their original order, and gives orphaned in-flight payloads a
    /// deadline so they come back after one timeout.
    async fn restore_expired(&self, queue: &QueueRef) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        // Deadlines first: one written after this read belongs to a payload
        // that is in the list read next, so it is never forgotten by mistake.
        let scored: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(deadlines_key(queue))
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        let inflight: Vec<String> = redis::cmd("LRANGE")
            .arg(inflight_key(queue))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let deadlines: HashMap<String, i64> = scored.into_iter().map(|(p, at)| (p, at as i64)).collect();
        let plan = plan_restore(&inflight, &deadlines, now_millis());

        // Pushing the newest first leaves the oldest at the head.
        for payload in plan.requeue.iter().rev() {
            let removed: i64 = redis::cmd("LREM")
                .arg(inflight_key(queue))
                .arg(1)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
            if removed > 0 {
                let _: i64 = redis::cmd("LPUSH").arg(queue.as_str()).arg(payload).query_async(&mut conn).await?;
            }
        }
        for payload in plan.requeue.iter().chain(&plan.forget) {
            let _: i64 = redis::cmd("ZREM").arg(deadlines_key(queue)).arg(payload).query_async(&mut conn).await?;
        }
        if !plan.adopt.is_empty() {
            log::warn!("Adopting {} in-flight message(s) without deadline on {}", plan.adopt.len(), queue);
        }
        for payload in &plan.adopt {
            let _: i64 = redis::cmd("ZADD")
                .arg(deadlines_key(queue))
                .arg("NX")
                .arg(self.visible_at())
                .arg(payload)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    fn visible_at(&self) -> i64 {
        now_millis().saturating_add(i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX))
    }

    async fn mark_in_flight(&self, queue: &QueueRef, payload: &str) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(deadlines_key(queue))
            .arg(self.visible_at())
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn first_message(&self, queue: &QueueRef, wait: Duration) -> RelayResult<Option<String>> {
        if wait.is_zero() {
            let mut conn = self.conn.clone();
            let payload: Option<String> = redis::cmd("LMOVE")
                .arg(queue.as_str())
                .arg(inflight_key(queue))
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            return Ok(payload);
        }
        let mut blocking = self.blocking.clone();
        let payload: Option<String> = redis::cmd("BLMOVE")
            .arg(queue.as_str())
            .arg(inflight_key(queue))
            .arg("LEFT")
            .arg("RIGHT")
            .arg(wait.as_secs_f64())
            .query_async(&mut blocking)
            .await?;
        Ok(payload)
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn create_queue(&self, name: &str) -> RelayResult<QueueRef> {
        let mut conn = self.conn.clone();
        let queue = QueueRef::new(format!("{}{}", QUEUE_PREFIX, name));
        let added: i64 = redis::cmd("SADD").arg(QUEUE_REGISTRY).arg(queue.as_str()).query_async(&mut conn).await?;
        if added == 0 {
            return Err(RelayError::AlreadyExists(format!("queue {}", name)));
        }
        Ok(queue)
    }

    async fn ensure_queue(&self, name: &str) -> RelayResult<QueueRef> {
        let mut conn = self.conn.clone();
        let queue = QueueRef::new(format!("{}{}", QUEUE_PREFIX, name));
        let _: i64 = redis::cmd("SADD").arg(QUEUE_REGISTRY).arg(queue.as_str()).query_async(&mut conn).await?;
        Ok(queue)
    }

    async fn delete_queue(&self, queue: &QueueRef) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("SREM").arg(QUEUE_REGISTRY).arg(queue.as_str()).query_async(&mut conn).await?;
        if removed == 0 {
            return Err(RelayError::NotFound(format!("queue {}", queue)));
        }
        let _: i64 = redis::cmd("DEL")
            .arg(queue.as_str())
            .arg(inflight_key(queue))
            .arg(deadlines_key(queue))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn send(&self, queue: &QueueRef, message: OutboundEnvelope) -> RelayResult<()> {
        self.require(queue).await?;
        let mut conn = self.conn.clone();

        let fresh: Option<String> = redis::cmd("SET")
            .arg(format!("{}{}", DEDUP_PREFIX, message.dedup_token))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if fresh.is_none() {
            log::debug!("Suppressed duplicate send {} on {}", message.dedup_token, queue);
            return Ok(());
        }

        let stored = StoredMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            group_key: message.group_key,
            envelope: message.envelope,
        };
        let payload = serde_json::to_string(&stored)?;
        let _: i64 = redis::cmd("RPUSH").arg(queue.as_str()).arg(payload).query_async(&mut conn).await?;
        Ok(())
    }

    async fn receive(&self, queue: &QueueRef, max: usize, wait: Duration) -> RelayResult<Vec<ReceivedMessage>> {
        self.require(queue).await?;
        self.restore_expired(queue).await?;

        if max == 0 {
            return Ok(Vec::new());
        }
        let mut payloads = Vec::new();
        if let Some(first) = self.first_message(queue, wait).await? {
            payloads.push(first);
        }
        while !payloads.is_empty() && payloads.len() < max {
            match self.first_message(queue, Duration::ZERO).await? {
                Some(next) => payloads.push(next),
                None => break,
            }
        }

        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            self.mark_in_flight(queue, &payload).await?;
            match serde_json::from_str::<StoredMessage>(&payload) {
                Ok(stored) => messages.push(ReceivedMessage { receipt_handle: payload, envelope: stored.envelope }),
                Err(e) => {
                    // Hand it out with an empty envelope so the router drops and acknowledges it.
                    log::warn!("Unreadable message on {}: {}", queue, e);
                    messages.push(ReceivedMessage { receipt_handle: payload, envelope: Envelope::default() });
                }
            }
        }
        Ok(messages)
    }

    async fn delete_message(&self, queue: &QueueRef, receipt_handle: &str) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(inflight_key(queue))
            .arg(1)
            .arg(receipt_handle)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("ZREM").arg(deadlines_key(queue)).arg(receipt_handle).query_async(&mut conn).await?;
        Ok(())
    }
}

// --- Config source ---

pub struct RedisConfigSource {
    conn: ConnectionManager,
}

#[async_trait]
impl ConfigSource for RedisConfigSource {
    async fn entries(&self) -> RelayResult<Vec<ConfigEntry>> {
        let mut conn = self.conn.clone();
        let map: BTreeMap<String, String> = redis::cmd("HGETALL").arg(CONFIG_HASH).query_async(&mut conn).await?;
        Ok(map.into_iter().map(|(name, value)| ConfigEntry::new(name, value)).collect())
    }

    async fn update_entry(&self, field_name: &str, field_value: &str) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("HEXISTS").arg(CONFIG_HASH).arg(field_name).query_async(&mut conn).await?;
        if !exists {
            return Err(RelayError::NotFound(format!("configuration field {}", field_name)));
        }
        let _: i64 = redis::cmd("HSET")
            .arg(CONFIG_HASH)
            .arg(field_name)
            .arg(field_value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_default(&self, entries: &[ConfigEntry]) -> RelayResult<()> {
        let mut conn = self.conn.clone();
        for entry in entries {
            let _: bool = redis::cmd("HSETNX")
                .arg(CONFIG_HASH)
                .arg(&entry.field_name)
                .arg(&entry.field_value)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }
}
