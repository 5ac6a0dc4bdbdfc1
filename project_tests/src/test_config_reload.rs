use lib_relay::configs::config_dynamic::{
    DENSITY_THRESHOLD, INBOUND_QUEUE, POSITIVE_RADIUS, RELOAD_DELAY_SECS, UNSET_QUEUE,
};
use lib_relay::configs::{ConfigReloader, default_entries, ensure_inbound_queue};
use lib_relay::connections::{ConfigSource, MemoryConfigSource, MemoryDirectory, MemoryTransport, Transport};
use lib_relay::core::{LogAlertSink, ReceiveSettings, Router, SharedThresholds};
use lib_relay::model::OutboundEnvelope;
use lib_relay::{Event, Position, QueueRef, SubscriberRecord};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

struct Setup {
    source: Arc<MemoryConfigSource>,
    transport: Arc<MemoryTransport>,
    directory: Arc<MemoryDirectory>,
    reloader: Arc<ConfigReloader>,
    router: Router,
    inbound: QueueRef,
}

async fn setup() -> Setup {
    let source = Arc::new(MemoryConfigSource::new(&default_entries()));
    let transport = Arc::new(MemoryTransport::default());
    let directory = Arc::new(MemoryDirectory::default());
    let thresholds = Arc::new(SharedThresholds::default());
    let reloader =
        Arc::new(ConfigReloader::new(source.clone(), Arc::clone(&thresholds)).with_transport(transport.clone()));
    reloader.reload_once().await.expect("initial load");
    let inbound = ensure_inbound_queue(&reloader, transport.as_ref()).await.expect("inbound");
    let router = Router::new(
        directory.clone(),
        transport.clone(),
        Arc::new(LogAlertSink),
        thresholds,
        ReceiveSettings { max_messages: 10, wait: Duration::ZERO },
    );
    Setup { source, transport, directory, reloader, router, inbound }
}

async fn neighbour(s: &Setup, id: &str, x: i64) -> QueueRef {
    let queue = s.transport.create_queue(id).await.expect("queue");
    s.directory.insert(SubscriberRecord::new(id, queue.clone()).at(Position::new(x, 0)));
    queue
}

fn health_alert(token: &str) -> OutboundEnvelope {
    let event = Event {
        source_id: "ospedale".into(),
        topic: "Sanita".into(),
        positive_count: 1,
        people_count: 4,
        area: 40,
        position: Position::new(0, 0),
        radius: 0,
        body: "nuovo caso".into(),
    };
    OutboundEnvelope { envelope: event.to_envelope(), group_key: "g".into(), dedup_token: token.into() }
}

#[tokio::test]
async fn test_positive_radius_change_applies_to_next_event() {
    let s = setup().await;
    let q = neighbour(&s, "at-eight", 8).await;

    s.transport.send(&s.inbound, health_alert("t1")).await.expect("send");
    s.router.poll_once().await.expect("poll");
    assert_eq!(s.transport.pending(&q), 0);

    s.reloader.update_field(POSITIVE_RADIUS, "8").await.expect("update");

    s.transport.send(&s.inbound, health_alert("t2")).await.expect("send");
    s.router.poll_once().await.expect("poll");
    assert_eq!(s.transport.pending(&q), 1);
}

#[tokio::test]
async fn test_reset_inbound_queue_keeps_router_polling() {
    let s = setup().await;
    let q = neighbour(&s, "at-two", 2).await;
    s.transport.send(&s.inbound, health_alert("t1")).await.expect("send before reset");

    s.reloader.update_field(INBOUND_QUEUE, UNSET_QUEUE).await.expect("reset");
    assert_eq!(s.reloader.thresholds().snapshot().inbound_queue, Some(s.inbound.clone()));

    let summary = s.router.poll_once().await.expect("poll after reset");
    assert_eq!(summary.routed, 1);
    assert_eq!(s.transport.pending(&q), 1);
}

#[tokio::test]
async fn test_broken_store_value_keeps_last_good_pair() {
    let s = setup().await;
    s.reloader.update_field(POSITIVE_RADIUS, "8").await.expect("update");
    let before = s.reloader.thresholds().snapshot();

    // Written behind the reloader's back, as an operator editing the store would.
    s.source.set(DENSITY_THRESHOLD, "high");
    s.source.set(POSITIVE_RADIUS, "1");
    assert!(s.reloader.reload_once().await.is_err());

    let after = s.reloader.thresholds().snapshot();
    assert_eq!(after.params, before.params);
    assert_eq!(after.params.positive_radius, 8);
}

#[tokio::test]
async fn test_reload_loop_runs_alongside_router() {
    let s = setup().await;
    s.reloader.update_field(RELOAD_DELAY_SECS, "1").await.expect("update");
    let q = neighbour(&s, "at-seven", 7).await;

    let (tx, _) = broadcast::channel(1);
    let reload_handle = {
        let reloader = Arc::clone(&s.reloader);
        let shutdown = tx.subscribe();
        tokio::spawn(async move { reloader.run(shutdown).await })
    };

    s.source
        .update_entry(POSITIVE_RADIUS, "7")
        .await
        .expect("store write");
    tokio::time::sleep(Duration::from_millis(1300)).await;

    s.transport.send(&s.inbound, health_alert("t1")).await.expect("send");
    s.router.poll_once().await.expect("poll");
    assert_eq!(s.transport.pending(&q), 1);

    tx.send(()).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(1), reload_handle)
        .await
        .expect("reloader stops")
        .expect("reloader task");
}
