use std::time::Duration;

use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};

use super::*;
use crate::bus::codec::Unmarshaler;
use crate::bus::connection::{ConnectionEvent, ConnectionObserver};
use crate::bus::transport::{Connector, MemoryBroker, MemoryConnector};
use crate::bus::SenderExt;
use crate::config::ConnectionConfig;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Ping {
    seq: u32,
}

fn factory(connector: MemoryConnector) -> Arc<ConnectionFactory> {
    let config = ConnectionConfig {
        use_default_connection: false,
        ..ConnectionConfig::default()
    };
    Arc::new(ConnectionFactory::new(Arc::new(connector), config))
}

#[tokio::test]
async fn test_send_before_connect_fails_fast() {
    let broker = MemoryBroker::new();
    let connector = broker
        .connector()
        .with_connect_delay(Duration::from_millis(200));
    let sender = LazySender::new(factory(connector), "keepalive");
    assert_eq!(sender.state(), SenderState::Idle);

    let started = std::time::Instant::now();
    let result = sender
        .send_json(&Context::background(), "keepalive", "node-1", &Ping { seq: 1 })
        .await;

    assert!(matches!(result, Err(BusError::NotConnected)));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(sender.state(), SenderState::Connecting);
}

#[tokio::test]
async fn test_start_connect_is_single_flight() {
    let broker = MemoryBroker::new();
    let connector = broker
        .connector()
        .with_connect_delay(Duration::from_millis(50));
    let sender = LazySender::new(factory(connector), "keepalive");

    let started: usize = (0..10)
        .map(|_| sender.clone())
        .map(|s| usize::from(s.start_connect()))
        .sum();
    assert_eq!(started, 1);

    sender.wait_connected().await.unwrap();
    assert_eq!(sender.state(), SenderState::Connected);
    assert!(!sender.start_connect());
}

#[tokio::test]
async fn test_send_after_connect_publishes() {
    let broker = MemoryBroker::new();
    let sender = LazySender::new(factory(broker.connector()), "keepalive");
    let observer = broker
        .connector()
        .connect(
            &crate::bus::transport::ConnectOptions {
                name: "observer".to_string(),
                reconnect: Default::default(),
                connect_timeout: Duration::from_secs(1),
            },
            Arc::new(crate::bus::connection::LoggingObserver),
        )
        .await
        .unwrap();
    let mut sub = observer.subscribe("keepalive", None).await.unwrap();

    sender.wait_connected().await.unwrap();
    sender
        .send_json(&Context::background(), "keepalive", "node-1", &Ping { seq: 7 })
        .await
        .unwrap();

    let raw = tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert!(raw.reply.is_none(), "sender must not wait for an ack");

    let message = HeaderMarshaler.unmarshal(&raw).unwrap();
    assert_eq!(message.decode_json::<Ping>().unwrap(), Ping { seq: 7 });
    assert_eq!(
        message.metadata.get(SOURCE_METADATA_KEY).map(String::as_str),
        Some("node-1")
    );
}

#[tokio::test]
async fn test_failed_connect_can_be_retried() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let sender = LazySender::new(factory(broker.connector()), "keepalive");

    let result = sender.wait_connected().await;
    assert!(matches!(result, Err(BusError::Connection(_))));
    assert!(matches!(sender.state(), SenderState::Failed(_)));

    broker.set_available(true);
    assert!(sender.start_connect());
    sender.wait_connected().await.unwrap();
    assert_eq!(sender.state(), SenderState::Connected);
}

#[tokio::test]
async fn test_cancelled_context_rejected() {
    let broker = MemoryBroker::new();
    let sender = LazySender::new(factory(broker.connector()), "keepalive");
    let ctx = Context::background();
    ctx.cancel();

    let result = sender.send_json(&ctx, "keepalive", "node-1", &Ping { seq: 1 }).await;
    assert!(matches!(result, Err(BusError::Cancelled)));
    assert_eq!(sender.state(), SenderState::Idle);
}

#[tokio::test]
async fn test_close_stops_sending() {
    let broker = MemoryBroker::new();
    let sender = LazySender::new(factory(broker.connector()), "keepalive");
    sender.wait_connected().await.unwrap();

    sender.close().await.unwrap();
    sender.close().await.unwrap();

    let result = sender
        .send_json(&Context::background(), "keepalive", "node-1", &Ping { seq: 1 })
        .await;
    assert!(matches!(result, Err(BusError::Closed(_))));
    assert!(!sender.start_connect());
}

#[tokio::test]
async fn test_reconnects_after_connection_closed() {
    let broker = MemoryBroker::new();
    let sender = LazySender::new(factory(broker.connector()), "keepalive");
    sender.wait_connected().await.unwrap();

    let connection = sender.connection().unwrap();
    connection.close().await.unwrap();

    let result = sender
        .send_json(&Context::background(), "keepalive", "node-1", &Ping { seq: 1 })
        .await;
    assert!(matches!(result, Err(BusError::NotConnected)));

    sender.wait_connected().await.unwrap();
    sender
        .send_json(&Context::background(), "keepalive", "node-1", &Ping { seq: 2 })
        .await
        .unwrap();
}

#[derive(Default)]
struct ClosedEvents {
    names: StdMutex<Vec<String>>,
}

impl ConnectionObserver for ClosedEvents {
    fn on_event(&self, event: ConnectionEvent) {
        if let ConnectionEvent::Closed { name } = event {
            self.names.lock().unwrap().push(name);
        }
    }
}

#[tokio::test]
async fn test_close_while_connecting_releases_connection() {
    let broker = MemoryBroker::new();
    let connector = broker
        .connector()
        .with_connect_delay(Duration::from_millis(100));
    let events = Arc::new(ClosedEvents::default());
    let config = ConnectionConfig {
        use_default_connection: false,
        ..ConnectionConfig::default()
    };
    let factory = Arc::new(
        ConnectionFactory::new(Arc::new(connector), config).with_observer(events.clone()),
    );
    let sender = LazySender::new(factory, "keepalive");

    assert!(sender.start_connect());
    sender.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(sender.state(), SenderState::Idle);
    assert!(sender.connection().is_none());
    assert_eq!(*events.names.lock().unwrap(), vec!["keepalive".to_string()]);
}

#[tokio::test]
async fn test_usable_as_trait_object() {
    let broker = MemoryBroker::new();
    let lazy = LazySender::new(factory(broker.connector()), "keepalive");
    lazy.wait_connected().await.unwrap();
    let sender: Arc<dyn Sender> = Arc::new(lazy);

    sender
        .send(&Context::background(), "keepalive", "node-1", Bytes::from_static(b"raw"))
        .await
        .unwrap();
    sender
        .send_json(&Context::background(), "keepalive", "node-1", &Ping { seq: 3 })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_send_json_reports_encode_failure() {
    let broker = MemoryBroker::new();
    let sender = LazySender::new(factory(broker.connector()), "keepalive");
    sender.wait_connected().await.unwrap();

    let mut bad = std::collections::HashMap::new();
    bad.insert(vec![1u8], 1u8);
    let result = sender
        .send_json(&Context::background(), "keepalive", "node-1", &bad)
        .await;
    assert!(matches!(result, Err(BusError::Marshal(_))));
}
