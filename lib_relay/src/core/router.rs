//! # Router Loop
//!
//! Drains the shared inbound queue. For every message: parse, evaluate alerts,
//! match, fan out, acknowledge. All of it uses one `ConfigSnapshot` taken when
//! the message is picked up.
//!
//! Acknowledgement policy (at-least-once):
//! - routed messages are deleted after the fan-out attempt, even if some
//!   recipients failed;
//! - malformed messages are deleted without routing;
//! - when the directory cannot be queried the message is left on the queue
//!   and reappears after the visibility timeout.

use crate::connections::{Directory, Transport};
use crate::core::alerts::{self, AlertSink};
use crate::core::dispatcher::Dispatcher;
use crate::core::matcher::Matcher;
use crate::core::thresholds::SharedThresholds;
use crate::error::{RelayError, RelayResult};
use crate::model::{Event, QueueRef, ReceivedMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Receive parameters that do not change at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSettings {
    /// Upper bound on messages fetched per receive call.
    pub max_messages: usize,
    /// Long-poll wait for a receive call.
    pub wait: Duration,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self { max_messages: 10, wait: Duration::from_secs(20) }
    }
}

/// Counters for one `poll_once` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub routed: usize,
    pub malformed: usize,
    /// Left on the queue for redelivery.
    pub deferred: usize,
    /// Individual recipient sends that failed.
    pub failed_sends: usize,
}

enum Disposition {
    Routed { failed_sends: usize },
    Malformed,
    Deferred,
}

pub struct Router {
    transport: Arc<dyn Transport>,
    matcher: Matcher,
    dispatcher: Dispatcher,
    alerts: Arc<dyn AlertSink>,
    thresholds: Arc<SharedThresholds>,
    settings: ReceiveSettings,
}

impl Router {
    pub fn new(
        directory: Arc<dyn Directory>,
        transport: Arc<dyn Transport>,
        alerts: Arc<dyn AlertSink>,
        thresholds: Arc<SharedThresholds>,
        settings: ReceiveSettings,
    ) -> Self {
        Self {
            matcher: Matcher::new(directory),
            dispatcher: Dispatcher::new(Arc::clone(&transport)),
            transport,
            alerts,
            thresholds,
            settings,
        }
    }

    fn inbound_queue(&self) -> RelayResult<QueueRef> {
        self.thresholds
            .snapshot()
            .inbound_queue
            .clone()
            .ok_or_else(|| RelayError::Config("inbound queue has not been bootstrapped".into()))
    }

    /// One receive call and the processing of everything it returned.
    pub async fn poll_once(&self) -> RelayResult<PollSummary> {
        let inbound = self.inbound_queue()?;
        let messages = self
            .transport
            .receive(&inbound, self.settings.max_messages, self.settings.wait)
            .await?;

        let mut summary = PollSummary { received: messages.len(), ..Default::default() };
        for message in messages {
            match self.process_message(&message).await {
                Disposition::Routed { failed_sends } => {
                    summary.routed += 1;
                    summary.failed_sends += failed_sends;
                    self.acknowledge(&inbound, &message).await;
                }
                Disposition::Malformed => {
                    summary.malformed += 1;
                    self.acknowledge(&inbound, &message).await;
                }
                Disposition::Deferred => summary.deferred += 1,
            }
        }
        Ok(summary)
    }

    async fn process_message(&self, message: &ReceivedMessage) -> Disposition {
        let event = match Event::from_envelope(&message.envelope) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping inbound message: {}", e);
                return Disposition::Malformed;
            }
        };
        match self.process_event(&event).await {
            Ok(failed_sends) => Disposition::Routed { failed_sends },
            Err(e) => {
                log::error!("Routing of event from {} deferred: {}", event.source_id, e);
                Disposition::Deferred
            }
        }
    }

    /// Alerts, match and fan-out for one parsed event. Returns the number of
    /// failed recipient sends; an `Err` means nothing was sent.
    pub async fn process_event(&self, event: &Event) -> RelayResult<usize> {
        let snapshot = self.thresholds.snapshot();

        for notice in alerts::evaluate(event, &snapshot.params) {
            self.alerts.notify(&notice);
        }

        let recipients = self.matcher.match_event(event, &snapshot.params).await?;
        let report = self.dispatcher.dispatch(event, &recipients).await;
        log::info!("{} -> reached {}/{} subscribers", event, report.delivered().len(), report.attempted());
        Ok(report.failed().len())
    }

    async fn acknowledge(&self, inbound: &QueueRef, message: &ReceivedMessage) {
        if let Err(e) = self.transport.delete_message(inbound, &message.receipt_handle).await {
            log::error!("Failed to delete inbound message, it will be redelivered: {}", e);
        }
    }

    /// Polls until a shutdown signal arrives, pausing `receive_delay` between polls.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        log::info!("Router started.");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.poll_once() => match result {
                    Ok(summary) if summary.received > 0 => log::debug!("Poll: {:?}", summary),
                    Ok(_) => {}
                    Err(e) => log::error!("Inbound receive failed: {}", e),
                },
            }

            let delay = self.thresholds.snapshot().delays.receive_delay;
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::info!("Router received shutdown signal.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{MemoryDirectory, MemoryTransport};
    use crate::core::alerts::AlertNotice;
    use crate::core::matcher::MatchFilter;
    use crate::core::thresholds::{ConfigSnapshot, OperationalDelays};
    use crate::model::{attr, AttributeValue, Envelope, OutboundEnvelope, Position, SubscriberRecord};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<AlertNotice>>);

    impl AlertSink for RecordingSink {
        fn notify(&self, notice: &AlertNotice) {
            self.0.lock().unwrap().push(notice.clone());
        }
    }

    struct Fixture {
        router: Router,
        transport: Arc<MemoryTransport>,
        directory: Arc<MemoryDirectory>,
        inbound: QueueRef,
        sink: Arc<RecordingSink>,
    }

    async fn fixture() -> Fixture {
        let directory = Arc::new(MemoryDirectory::default());
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(50)));
        let inbound = transport.create_queue("relay-inbound").await.unwrap();
        let thresholds = Arc::new(SharedThresholds::new(ConfigSnapshot {
            inbound_queue: Some(inbound.clone()),
            delays: OperationalDelays {
                receive_delay: Duration::from_millis(5),
                reload_delay: Duration::from_secs(60),
            },
            ..Default::default()
        }));
        let sink = Arc::new(RecordingSink::default());
        let router = Router::new(
            directory.clone(),
            transport.clone(),
            sink.clone(),
            thresholds,
            ReceiveSettings { max_messages: 10, wait: Duration::ZERO },
        );
        Fixture { router, transport, directory, inbound, sink }
    }

    fn sample_event() -> Event {
        Event {
            source_id: "farmacia-1".into(),
            topic: "Farmacia".into(),
            positive_count: 0,
            people_count: 90,
            area: 30,
            position: Position::new(6, 6),
            radius: 3,
            body: "coda lunga".into(),
        }
    }

    async fn publish(f: &Fixture, envelope: Envelope) {
        let out = OutboundEnvelope { envelope, group_key: "pub".into(), dedup_token: uuid::Uuid::new_v4().to_string() };
        f.transport.send(&f.inbound, out).await.unwrap();
    }

    async fn subscriber(f: &Fixture, id: &str, topics: &[&str], at: (i64, i64)) -> QueueRef {
        let queue = f.transport.create_queue(id).await.unwrap();
        f.directory.insert(
            SubscriberRecord::new(id, queue.clone())
                .with_topics(topics.iter().copied())
                .at(Position::new(at.0, at.1)),
        );
        queue
    }

    #[tokio::test]
    async fn test_routed_message_is_delivered_and_deleted() {
        let f = fixture().await;
        let a = subscriber(&f, "a", &["Farmacia"], (5, 5)).await;
        publish(&f, sample_event().to_envelope()).await;

        let summary = f.router.poll_once().await.unwrap();
        assert_eq!(summary.routed, 1);
        assert_eq!(f.transport.pending(&a), 1);
        assert_eq!(f.transport.pending(&f.inbound), 0);
        assert_eq!(f.transport.in_flight(&f.inbound), 0);

        // density 3.0 >= 2.5
        assert_eq!(f.sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_deleted_without_routing() {
        let f = fixture().await;
        let a = subscriber(&f, "a", &["Farmacia"], (5, 5)).await;
        let bad = sample_event()
            .to_envelope()
            .with_attribute(attr::RADIUS, AttributeValue::number(-2));
        publish(&f, bad).await;

        let summary = f.router.poll_once().await.unwrap();
        assert_eq!(summary.malformed, 1);
        assert_eq!(f.transport.pending(&a), 0);
        assert_eq!(f.transport.in_flight(&f.inbound), 0);
        assert!(f.sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_recipient_queue_still_acknowledges() {
        let f = fixture().await;
        f.directory.insert(
            SubscriberRecord::new("ghost", QueueRef::new("gone"))
                .with_topics(["Farmacia"])
                .at(Position::new(6, 6)),
        );
        let a = subscriber(&f, "a", &["Farmacia"], (5, 5)).await;
        publish(&f, sample_event().to_envelope()).await;

        let summary = f.router.poll_once().await.unwrap();
        assert_eq!(summary.failed_sends, 1);
        assert_eq!(f.transport.pending(&a), 1);
        assert_eq!(f.transport.in_flight(&f.inbound), 0);
    }

    struct DownDirectory;

    #[async_trait]
    impl Directory for DownDirectory {
        async fn scan(&self, _filter: &MatchFilter) -> RelayResult<Vec<SubscriberRecord>> {
            Err(RelayError::Directory("unavailable".into()))
        }
        async fn get(&self, _id: &str) -> RelayResult<Option<SubscriberRecord>> {
            Err(RelayError::Directory("unavailable".into()))
        }
        async fn put_new(&self, _record: SubscriberRecord) -> RelayResult<()> {
            Err(RelayError::Directory("unavailable".into()))
        }
        async fn update(&self, _record: SubscriberRecord) -> RelayResult<()> {
            Err(RelayError::Directory("unavailable".into()))
        }
        async fn delete(&self, _id: &str) -> RelayResult<()> {
            Err(RelayError::Directory("unavailable".into()))
        }
        async fn list(&self) -> RelayResult<Vec<SubscriberRecord>> {
            Err(RelayError::Directory("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_directory_failure_leaves_message_for_redelivery() {
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(20)));
        let inbound = transport.create_queue("relay-inbound").await.unwrap();
        let thresholds = Arc::new(SharedThresholds::new(ConfigSnapshot {
            inbound_queue: Some(inbound.clone()),
            ..Default::default()
        }));
        let router = Router::new(
            Arc::new(DownDirectory),
            transport.clone(),
            Arc::new(RecordingSink::default()),
            thresholds,
            ReceiveSettings { max_messages: 10, wait: Duration::ZERO },
        );
        let out = OutboundEnvelope {
            envelope: sample_event().to_envelope(),
            group_key: "g".into(),
            dedup_token: "t1".into(),
        };
        transport.send(&inbound, out).await.unwrap();

        let summary = router.poll_once().await.unwrap();
        assert_eq!(summary.deferred, 1);
        assert_eq!(transport.in_flight(&inbound), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = router.poll_once().await.unwrap();
        assert_eq!(again.received, 1);
    }

    #[tokio::test]
    async fn test_poll_without_bootstrap_is_config_error() {
        let router = Router::new(
            Arc::new(MemoryDirectory::default()),
            Arc::new(MemoryTransport::default()),
            Arc::new(RecordingSink::default()),
            Arc::new(SharedThresholds::default()),
            ReceiveSettings::default(),
        );
        assert!(matches!(router.poll_once().await, Err(RelayError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture().await;
        let a = subscriber(&f, "a", &["Farmacia"], (5, 5)).await;
        publish(&f, sample_event().to_envelope()).await;

        let (tx, rx) = broadcast::channel(1);
        let router = Arc::new(f.router);
        let handle = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(f.transport.pending(&a), 1);
    }
}
