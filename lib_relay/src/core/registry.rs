//! # Subscriber Registry
//!
//! Lifecycle operations behind the control plane: register, deregister, topic
//! and position edits. Every mutation is a whole-record read-modify-write,
//! so concurrent edits of one subscriber are last-writer-wins.

use crate::connections::{Directory, Transport};
use crate::error::{RelayError, RelayResult};
use crate::model::{Position, QueueRef, SubscriberRecord};
use std::sync::Arc;

/// Identity handed back to a freshly registered subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    pub queue_ref: QueueRef,
}

pub struct SubscriberRegistry {
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
    attempts: u32,
}

impl SubscriberRegistry {
    pub fn new(directory: Arc<dyn Directory>, transport: Arc<dyn Transport>, attempts: u32) -> Self {
        Self { directory, transport, attempts: attempts.max(1) }
    }

    /// Creates a new subscriber with an empty topic set at the origin.
    ///
    /// Id collisions on either the queue or the directory entry are retried
    /// with a fresh id, up to the configured number of attempts.
    pub async fn register(&self) -> RelayResult<Registration> {
        for attempt in 1..=self.attempts {
            let id = uuid::Uuid::new_v4().simple().to_string();

            let queue_ref = match self.transport.create_queue(&id).await {
                Ok(queue_ref) => queue_ref,
                Err(RelayError::AlreadyExists(_)) => {
                    log::warn!("Queue name collision on attempt {}, retrying", attempt);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let record = SubscriberRecord::new(id.clone(), queue_ref.clone());
            match self.directory.put_new(record).await {
                Ok(()) => {
                    log::info!("Subscriber '{}' registered on {}", id, queue_ref);
                    return Ok(Registration { id, queue_ref });
                }
                Err(e) => {
                    self.release_queue(&queue_ref).await;
                    if matches!(e, RelayError::AlreadyExists(_)) {
                        log::warn!("Subscriber id collision on attempt {}, retrying", attempt);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(RelayError::RegistrationExhausted(self.attempts))
    }

    async fn release_queue(&self, queue_ref: &QueueRef) {
        if let Err(e) = self.transport.delete_queue(queue_ref).await {
            log::error!("Failed to release queue {}: {}", queue_ref, e);
        }
    }

    /// Removes the subscriber. Unknown ids succeed. A queue that cannot be
    /// deleted is logged and the directory entry is removed anyway.
    pub async fn deregister(&self, id: &str) -> RelayResult<()> {
        let Some(record) = self.directory.get(id).await? else {
            log::debug!("Deregister of unknown subscriber '{}'", id);
            return Ok(());
        };
        if let Err(e) = self.transport.delete_queue(&record.queue_ref).await {
            log::error!("Failed to delete queue of subscriber '{}': {}", id, e);
        }
        self.directory.delete(id).await?;
        log::info!("Subscriber '{}' deregistered", id);
        Ok(())
    }

    pub async fn add_topics<I, S>(&self, id: &str, topics: I) -> RelayResult<SubscriberRecord>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut record = self.require(id).await?;
        for topic in topics {
            record.topics.insert(topic.into());
        }
        self.directory.update(record.clone()).await?;
        Ok(record)
    }

    pub async fn remove_topics<I, S>(&self, id: &str, topics: I) -> RelayResult<SubscriberRecord>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut record = self.require(id).await?;
        for topic in topics {
            record.topics.remove(topic.as_ref());
        }
        self.directory.update(record.clone()).await?;
        Ok(record)
    }

    pub async fn update_position(&self, id: &str, position: Position) -> RelayResult<SubscriberRecord> {
        let mut record = self.require(id).await?;
        record.position = position;
        self.directory.update(record.clone()).await?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> RelayResult<Option<SubscriberRecord>> {
        self.directory.get(id).await
    }

    pub async fn list(&self) -> RelayResult<Vec<SubscriberRecord>> {
        self.directory.list().await
    }

    async fn require(&self, id: &str) -> RelayResult<SubscriberRecord> {
        self.directory
            .get(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("subscriber {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{MemoryDirectory, MemoryTransport};
    use crate::core::matcher::MatchFilter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> (SubscriberRegistry, Arc<MemoryDirectory>, Arc<MemoryTransport>) {
        let directory = Arc::new(MemoryDirectory::default());
        let transport = Arc::new(MemoryTransport::default());
        (SubscriberRegistry::new(directory.clone(), transport.clone(), 3), directory, transport)
    }

    #[tokio::test]
    async fn test_register_creates_queue_and_entry() {
        let (registry, directory, transport) = registry();
        let first = registry.register().await.unwrap();
        let second = registry.register().await.unwrap();
        assert_ne!(first.id, second.id);

        let record = directory.get(&first.id).await.unwrap().unwrap();
        assert!(record.topics.is_empty());
        assert_eq!(record.position, Position::new(0, 0));
        assert!(transport.has_queue(&first.queue_ref));
    }

    #[tokio::test]
    async fn test_topic_edits() {
        let (registry, _, _) = registry();
        let reg = registry.register().await.unwrap();

        registry.add_topics(&reg.id, ["Bar", "Farmacia"]).await.unwrap();
        let record = registry.remove_topics(&reg.id, ["Bar", "Never"]).await.unwrap();
        assert_eq!(record.topics.iter().collect::<Vec<_>>(), vec!["Farmacia"]);

        let record = registry.remove_topics(&reg.id, ["Farmacia"]).await.unwrap();
        assert!(record.topics.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (registry, _, _) = registry();
        let err = registry.update_position("nope", Position::new(1, 1)).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
        assert!(matches!(registry.add_topics("nope", ["x"]).await, Err(RelayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let (registry, directory, transport) = registry();
        let reg = registry.register().await.unwrap();

        registry.deregister(&reg.id).await.unwrap();
        assert!(directory.get(&reg.id).await.unwrap().is_none());
        assert!(!transport.has_queue(&reg.queue_ref));

        registry.deregister(&reg.id).await.unwrap();
        registry.deregister("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_deregister_survives_missing_queue() {
        let (registry, directory, transport) = registry();
        let reg = registry.register().await.unwrap();
        transport.delete_queue(&reg.queue_ref).await.unwrap();

        registry.deregister(&reg.id).await.unwrap();
        assert!(directory.get(&reg.id).await.unwrap().is_none());
    }

    /// Directory that reports a collision for the first `collisions` inserts.
    struct CollidingDirectory {
        inner: MemoryDirectory,
        collisions: AtomicU32,
    }

    #[async_trait]
    impl Directory for CollidingDirectory {
        async fn scan(&self, filter: &MatchFilter) -> RelayResult<Vec<SubscriberRecord>> {
            self.inner.scan(filter).await
        }
        async fn get(&self, id: &str) -> RelayResult<Option<SubscriberRecord>> {
            self.inner.get(id).await
        }
        async fn put_new(&self, record: SubscriberRecord) -> RelayResult<()> {
            let left = self.collisions.load(Ordering::SeqCst);
            if left > 0 {
                self.collisions.store(left - 1, Ordering::SeqCst);
                return Err(RelayError::AlreadyExists(record.id));
            }
            self.inner.put_new(record).await
        }
        async fn update(&self, record: SubscriberRecord) -> RelayResult<()> {
            self.inner.update(record).await
        }
        async fn delete(&self, id: &str) -> RelayResult<()> {
            self.inner.delete(id).await
        }
        async fn list(&self) -> RelayResult<Vec<SubscriberRecord>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_collision_retries_then_succeeds() {
        let directory = Arc::new(CollidingDirectory {
            inner: MemoryDirectory::default(),
            collisions: AtomicU32::new(2),
        });
        let transport = Arc::new(MemoryTransport::default());
        let registry = SubscriberRegistry::new(directory.clone(), transport.clone(), 3);

        let reg = registry.register().await.unwrap();
        assert_eq!(directory.list().await.unwrap().len(), 1);
        // Queues created for the colliding attempts were released.
        assert_eq!(transport.queue_count(), 1);
        assert!(transport.has_queue(&reg.queue_ref));
    }

    #[tokio::test]
    async fn test_collision_budget_is_bounded() {
        let directory = Arc::new(CollidingDirectory {
            inner: MemoryDirectory::default(),
            collisions: AtomicU32::new(10),
        });
        let transport = Arc::new(MemoryTransport::default());
        let registry = SubscriberRegistry::new(directory, transport.clone(), 3);

        let err = registry.register().await.unwrap_err();
        assert!(matches!(err, RelayError::RegistrationExhausted(3)));
        assert_eq!(transport.queue_count(), 0);
    }
}
