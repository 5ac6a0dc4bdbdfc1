//! # Relay Flow Integration Tests
//!
//! Drives the router end to end over the in-memory collaborators: subscribers
//! register through the registry, a publisher enqueues on the inbound queue,
//! and the tests read back what landed on each private queue.

use lib_relay::configs::{ConfigReloader, default_entries, ensure_inbound_queue};
use lib_relay::connections::{MemoryConfigSource, MemoryDirectory, MemoryTransport, Transport};
use lib_relay::core::{AlertNotice, AlertSink, ReceiveSettings, Router, SharedThresholds, SubscriberRegistry};
use lib_relay::model::OutboundEnvelope;
use lib_relay::{Event, Position, QueueRef};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

#[derive(Default)]
struct CollectingSink(Mutex<Vec<AlertNotice>>);

impl AlertSink for CollectingSink {
    fn notify(&self, notice: &AlertNotice) {
        self.0.lock().expect("sink lock").push(notice.clone());
    }
}

struct Relay {
    transport: Arc<MemoryTransport>,
    registry: SubscriberRegistry,
    router: Router,
    inbound: QueueRef,
    alerts: Arc<CollectingSink>,
}

async fn relay(visibility: Duration) -> Relay {
    let directory = Arc::new(MemoryDirectory::default());
    let transport = Arc::new(MemoryTransport::new(visibility));
    let source = Arc::new(MemoryConfigSource::new(&default_entries()));
    let thresholds = Arc::new(SharedThresholds::default());
    let reloader = ConfigReloader::new(source, Arc::clone(&thresholds));
    reloader.reload_once().await.expect("initial configuration");
    let inbound = ensure_inbound_queue(&reloader, transport.as_ref())
        .await
        .expect("inbound queue");

    let alerts = Arc::new(CollectingSink::default());
    let router = Router::new(
        directory.clone(),
        transport.clone(),
        alerts.clone(),
        thresholds,
        ReceiveSettings { max_messages: 10, wait: Duration::ZERO },
    );
    let registry = SubscriberRegistry::new(directory, transport.clone(), 3);
    Relay { transport, registry, router, inbound, alerts }
}

impl Relay {
    async fn subscriber(&self, topics: &[&str], x: i64, y: i64) -> (String, QueueRef) {
        let reg = self.registry.register().await.expect("register");
        self.registry
            .add_topics(&reg.id, topics.iter().copied())
            .await
            .expect("topics");
        self.registry
            .update_position(&reg.id, Position::new(x, y))
            .await
            .expect("position");
        (reg.id, reg.queue_ref)
    }

    async fn publish(&self, event: &Event, token: &str) {
        let out = OutboundEnvelope {
            envelope: event.to_envelope(),
            group_key: "publisher".into(),
            dedup_token: token.into(),
        };
        self.transport.send(&self.inbound, out).await.expect("publish");
    }

    async fn drain(&self, queue: &QueueRef) -> Vec<Event> {
        self.transport
            .receive(queue, 100, Duration::ZERO)
            .await
            .expect("receive")
            .iter()
            .map(|m| Event::from_envelope(&m.envelope).expect("forwarded envelope parses"))
            .collect()
    }
}

fn event(topic: &str, radius: u32, x: i64, y: i64, positive: u64) -> Event {
    Event {
        source_id: "struttura-1".into(),
        topic: topic.into(),
        positive_count: positive,
        people_count: 10,
        area: 100,
        position: Position::new(x, y),
        radius,
        body: format!("{} update", topic),
    }
}

#[tokio::test]
async fn test_topic_and_radius_scenario() {
    let relay = relay(Duration::from_secs(30)).await;
    let (_, a) = relay.subscriber(&["Farmacia"], 5, 5).await;

    relay.publish(&event("Farmacia", 3, 6, 6, 0), "e1").await;
    relay.publish(&event("Altro", 3, 6, 6, 0), "e2").await;
    let summary = relay.router.poll_once().await.expect("poll");
    assert_eq!(summary.routed, 2);

    let got = relay.drain(&a).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].topic, "Farmacia");
    assert_eq!(got[0].body, "Farmacia update");
}

#[tokio::test]
async fn test_positive_case_reaches_uninterested_neighbour() {
    let relay = relay(Duration::from_secs(30)).await;
    let (_, b) = relay.subscriber(&[], 5, 0).await;
    let (_, far) = relay.subscriber(&["Bar"], 6, 0).await;

    relay.publish(&event("Bar", 0, 0, 0, 2), "e1").await;
    relay.router.poll_once().await.expect("poll");

    assert_eq!(relay.drain(&b).await.len(), 1);
    // Default positive radius is 5, so (6, 0) is outside even with a matching topic.
    assert!(relay.drain(&far).await.is_empty());

    let alerts = relay.alerts.0.lock().expect("sink lock");
    assert!(alerts.iter().any(|n| matches!(n, AlertNotice::PositiveCases { count: 2, .. })));
}

#[tokio::test]
async fn test_broadcast_reaches_every_topic_subscriber() {
    let relay = relay(Duration::from_secs(30)).await;
    let (_, near) = relay.subscriber(&["Uffici"], 0, 0).await;
    let (_, far) = relay.subscriber(&["Uffici"], 10_000, -10_000).await;
    let (_, other) = relay.subscriber(&["Bar"], 0, 0).await;

    relay.publish(&event("Uffici", 0, 0, 0, 0), "e1").await;
    relay.router.poll_once().await.expect("poll");

    assert_eq!(relay.drain(&near).await.len(), 1);
    assert_eq!(relay.drain(&far).await.len(), 1);
    assert!(relay.drain(&other).await.is_empty());
}

#[tokio::test]
async fn test_deregistered_subscriber_stops_receiving() {
    let relay = relay(Duration::from_secs(30)).await;
    let (gone_id, _) = relay.subscriber(&["Bar"], 0, 0).await;
    let (_, stays) = relay.subscriber(&["Bar"], 0, 0).await;

    relay.registry.deregister(&gone_id).await.expect("deregister");
    relay.registry.deregister(&gone_id).await.expect("second deregister is a no-op");
    assert!(relay.registry.get(&gone_id).await.expect("get").is_none());

    relay.publish(&event("Bar", 0, 0, 0, 0), "e1").await;
    let summary = relay.router.poll_once().await.expect("poll");
    assert_eq!(summary.failed_sends, 0);
    assert_eq!(relay.drain(&stays).await.len(), 1);
}

#[tokio::test]
async fn test_density_boundary_alerts() {
    let relay = relay(Duration::from_secs(30)).await;
    let crowded = Event { people_count: 90, area: 30, ..event("Bar", 0, 0, 0, 0) };
    let calm = Event { people_count: 60, area: 30, ..event("Bar", 0, 0, 0, 0) };
    let exact = Event { people_count: 75, area: 30, ..event("Bar", 0, 0, 0, 0) };

    relay.publish(&crowded, "c").await;
    relay.publish(&calm, "d").await;
    relay.publish(&exact, "e").await;
    relay.router.poll_once().await.expect("poll");

    let alerts = relay.alerts.0.lock().expect("sink lock");
    let ratios: Vec<f64> = alerts
        .iter()
        .filter_map(|n| match n {
            AlertNotice::Density { ratio, .. } => Some(*ratio),
            _ => None,
        })
        .collect();
    assert_eq!(ratios, vec![3.0, 2.5]);
}

#[tokio::test]
async fn test_inbound_event_is_acknowledged_exactly_once() {
    let relay = relay(Duration::from_millis(50)).await;
    let (_, a) = relay.subscriber(&["Bar"], 0, 0).await;

    relay.publish(&event("Bar", 0, 0, 0, 0), "e1").await;
    relay.router.poll_once().await.expect("poll");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Acknowledged, so nothing comes back after the visibility timeout.
    let again = relay.router.poll_once().await.expect("poll");
    assert_eq!(again.received, 0);
    assert_eq!(relay.drain(&a).await.len(), 1);
}

#[tokio::test]
async fn test_unacknowledged_inbound_event_is_redelivered() {
    let relay = relay(Duration::from_millis(50)).await;
    let (_, a) = relay.subscriber(&["Bar"], 0, 0).await;
    relay.publish(&event("Bar", 0, 0, 0, 0), "e1").await;

    // A worker that crashed after receiving: the message is taken but never deleted.
    let taken = relay
        .transport
        .receive(&relay.inbound, 10, Duration::ZERO)
        .await
        .expect("receive");
    assert_eq!(taken.len(), 1);
    assert!(relay.drain(&a).await.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = relay.router.poll_once().await.expect("poll");
    assert_eq!(summary.routed, 1);
    assert_eq!(relay.drain(&a).await.len(), 1);
}
