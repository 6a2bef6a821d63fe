use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::bus::transport::{MemoryBroker, TransportSubscription};
use crate::config::ConnectionConfig;

async fn connection(broker: &MemoryBroker) -> Connection {
    ConnectionFactory::new(Arc::new(broker.connector()), ConnectionConfig::default())
        .create("test")
        .await
        .unwrap()
}

fn short_timeout() -> PublisherConfig {
    PublisherConfig::default().with_ack_wait_timeout(Duration::from_millis(100))
}

/// Answer every request on `subscription` with `reply`, counting them.
fn responder(
    connection: Connection,
    mut subscription: Box<dyn TransportSubscription>,
    reply: &'static str,
) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    tokio::spawn(async move {
        while let Some(raw) = subscription.next().await {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(inbox) = raw.reply {
                let _ = connection.respond(&inbox, Bytes::from_static(reply.as_bytes())).await;
            }
        }
    });
    count
}

#[tokio::test]
async fn test_no_ack_topic_returns_without_subscriber() {
    let broker = MemoryBroker::new();
    let config = PublisherConfig::default()
        .with_no_ack_topic("keepalive")
        .with_ack_wait_timeout(Duration::from_secs(5));
    let publisher = AckPublisher::new(config, connection(&broker).await);

    let started = std::time::Instant::now();
    publisher
        .publish("keepalive", vec![Message::with_uuid("1", "ping")])
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_no_ack_publish_carries_no_reply_subject() {
    let broker = MemoryBroker::new();
    let conn = connection(&broker).await;
    let mut sub = conn.subscribe("keepalive", None).await.unwrap();
    let publisher = AckPublisher::new(
        PublisherConfig::default().with_no_ack_topic("keepalive"),
        Arc::clone(&conn),
    );

    publisher
        .publish("keepalive", vec![Message::with_uuid("1", "ping")])
        .await
        .unwrap();

    let raw = tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert!(raw.reply.is_none());
    assert_eq!(raw.payload_str(), "ping");
}

#[tokio::test]
async fn test_ack_topic_without_subscriber_times_out() {
    let broker = MemoryBroker::new();
    let publisher = AckPublisher::new(short_timeout(), connection(&broker).await);

    let started = std::time::Instant::now();
    let result = publisher
        .publish("health", vec![Message::with_uuid("1", "ping")])
        .await;

    match result {
        Err(BusError::AckTimeout { topic, timeout }) => {
            assert_eq!(topic, "health");
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected ack timeout, got {:?}", other),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn test_ok_reply_is_success() {
    let broker = MemoryBroker::new();
    let conn = connection(&broker).await;
    let sub = conn.subscribe("health", None).await.unwrap();
    let seen = responder(Arc::clone(&conn), sub, "OK");

    let publisher = AckPublisher::new(short_timeout(), conn);
    publisher
        .publish("health", vec![Message::with_uuid("1", "ping")])
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_other_reply_is_rejection() {
    let broker = MemoryBroker::new();
    let conn = connection(&broker).await;
    let sub = conn.subscribe("health", None).await.unwrap();
    responder(Arc::clone(&conn), sub, "Nacked");

    let publisher = AckPublisher::new(short_timeout(), conn);
    let err = publisher
        .publish("health", vec![Message::with_uuid("1", "ping")])
        .await
        .unwrap_err();

    assert!(matches!(&err, BusError::Rejected { reply, .. } if reply == "Nacked"));
    assert!(err.to_string().contains("Nacked"));
}

#[tokio::test]
async fn test_first_failure_aborts_remaining_messages() {
    let broker = MemoryBroker::new();
    let conn = connection(&broker).await;
    let sub = conn.subscribe("health", None).await.unwrap();
    let seen = responder(Arc::clone(&conn), sub, "Nacked");

    let publisher = AckPublisher::new(short_timeout(), conn);
    let result = publisher
        .publish(
            "health",
            vec![
                Message::with_uuid("1", "first"),
                Message::with_uuid("2", "second"),
                Message::with_uuid("3", "third"),
            ],
        )
        .await;

    assert!(result.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_marshal_failure_aborts_publish() {
    let broker = MemoryBroker::new();
    let publisher = AckPublisher::new(short_timeout(), connection(&broker).await);

    let result = publisher
        .publish("health", vec![Message::with_uuid("", "ping")])
        .await;
    assert!(matches!(result, Err(BusError::Marshal(_))));
}

#[tokio::test]
async fn test_publish_after_close_fails() {
    let broker = MemoryBroker::new();
    let conn = connection(&broker).await;
    let publisher = AckPublisher::new(short_timeout(), Arc::clone(&conn));

    publisher.close().await.unwrap();
    publisher.close().await.unwrap();

    let result = publisher
        .publish("health", vec![Message::with_uuid("1", "ping")])
        .await;
    assert!(matches!(result, Err(BusError::Closed(_))));
    // Borrowed connection stays open.
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_owned_connection_closed_with_publisher() {
    let broker = MemoryBroker::new();
    let config = ConnectionConfig {
        use_default_connection: false,
        ..ConnectionConfig::default()
    };
    let factory = ConnectionFactory::new(Arc::new(broker.connector()), config);
    let publisher = AckPublisher::connect(&factory, "oplog-publisher", short_timeout())
        .await
        .unwrap();

    assert!(publisher.owns_connection);
    publisher.close().await.unwrap();

    assert!(publisher.connection.is_closed());
    assert!(publisher.is_closed());
}
