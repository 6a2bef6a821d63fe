//! NATS core transport.
//!
//! Request/reply acknowledgments on plain NATS subjects; queue groups map
//! directly onto NATS queue subscriptions. Reconnection is left to the
//! `async-nats` client, configured from the `ReconnectPolicy`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_nats::{client::RequestErrorKind, Event, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, warn};

use super::{ConnectOptions, Connector, RawMessage, Transport, TransportSubscription};
use crate::bus::connection::{ConnectionEvent, ConnectionObserver};
use crate::bus::{BusError, Result};

/// Dials a NATS server.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn Transport>> {
        let closed = Arc::new(AtomicBool::new(false));
        let delay = options.reconnect.delay;

        let events = Arc::new(EventTranslator::new(
            options.name.clone(),
            self.url.clone(),
            Arc::clone(&closed),
        ));
        let events_observer = Arc::clone(&observer);
        let client = async_nats::ConnectOptions::new()
            .name(&options.name)
            .connection_timeout(options.connect_timeout)
            .max_reconnects(options.reconnect.max_attempts())
            .reconnect_delay_callback(move |_attempts| delay)
            .event_callback(move |event| {
                let events = Arc::clone(&events);
                let observer = Arc::clone(&events_observer);
                async move {
                    match events.translate(&event) {
                        Some(translated) => observer.on_event(translated),
                        None => debug!(connection = %events.name, event = %event, "NATS event"),
                    }
                }
            })
            .connect(self.url.as_str())
            .await
            .map_err(|e| {
                BusError::Connection(format!("Failed to connect to {}: {}", self.url, e))
            })?;

        Ok(Arc::new(NatsConnection {
            client: RwLock::new(Some(client)),
            name: options.name.clone(),
            closed,
            observer,
        }))
    }
}

/// Maps client events onto `ConnectionEvent`s.
///
/// `Connected` only counts as a reconnect after a reported drop, and
/// `Closed` is reported once.
struct EventTranslator {
    name: String,
    url: String,
    closed: Arc<AtomicBool>,
    disconnected: AtomicBool,
}

impl EventTranslator {
    fn new(name: String, url: String, closed: Arc<AtomicBool>) -> Self {
        Self {
            name,
            url,
            closed,
            disconnected: AtomicBool::new(false),
        }
    }

    fn translate(&self, event: &Event) -> Option<ConnectionEvent> {
        match event {
            Event::Disconnected => {
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
                self.disconnected.store(true, Ordering::SeqCst);
                Some(ConnectionEvent::Disconnected {
                    name: self.name.clone(),
                    error: None,
                })
            }
            Event::Connected => self.disconnected.swap(false, Ordering::SeqCst).then(|| {
                ConnectionEvent::Reconnected {
                    name: self.name.clone(),
                    url: self.url.clone(),
                }
            }),
            Event::Closed => {
                (!self.closed.swap(true, Ordering::SeqCst)).then(|| ConnectionEvent::Closed {
                    name: self.name.clone(),
                })
            }
            _ => None,
        }
    }
}

/// Connection backed by an `async_nats::Client`.
pub struct NatsConnection {
    client: RwLock<Option<async_nats::Client>>,
    name: String,
    closed: Arc<AtomicBool>,
    observer: Arc<dyn ConnectionObserver>,
}

impl NatsConnection {
    fn client(&self) -> Result<async_nats::Client> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed("connection"));
        }
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(BusError::Closed("connection"))
    }
}

fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn from_nats(message: async_nats::Message) -> RawMessage {
    let headers = message
        .headers
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(name, values)| {
                    values
                        .first()
                        .map(|value| (name.to_string(), value.as_str().to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    RawMessage {
        subject: message.subject.to_string(),
        reply: message.reply.map(|r| r.to_string()),
        headers,
        payload: message.payload,
    }
}

#[async_trait]
impl Transport for NatsConnection {
    async fn publish(&self, message: RawMessage) -> Result<()> {
        let client = self.client()?;
        client
            .publish_with_headers(
                message.subject,
                to_header_map(&message.headers),
                message.payload,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))
    }

    async fn request(&self, message: RawMessage, timeout: Duration) -> Result<RawMessage> {
        let client = self.client()?;
        let topic = message.subject.clone();
        let request = async_nats::Request::new()
            .headers(to_header_map(&message.headers))
            .payload(message.payload)
            .timeout(Some(timeout));

        match client.send_request(message.subject, request).await {
            Ok(reply) => Ok(from_nats(reply)),
            Err(e) => match e.kind() {
                // Without responders nobody can ever acknowledge; report it
                // the same way as an expired wait.
                RequestErrorKind::TimedOut | RequestErrorKind::NoResponders => {
                    Err(BusError::AckTimeout { topic, timeout })
                }
                RequestErrorKind::Other => {
                    Err(BusError::Publish(format!("Request on '{}' failed: {}", topic, e)))
                }
            },
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn TransportSubscription>> {
        let client = self.client()?;
        let subscriber = match queue_group {
            Some(group) => {
                client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to '{}': {}", subject, e)))?;

        // Make sure the server registered the interest before returning.
        client
            .flush()
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to flush subscription: {}", e)))?;

        Ok(Box::new(NatsSubscription {
            subscriber: Some(subscriber),
        }))
    }

    async fn respond(&self, reply: &str, payload: Bytes) -> Result<()> {
        let client = self.client()?;
        client
            .publish(reply.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(format!("Failed to reply: {}", e)))
    }

    async fn flush(&self) -> Result<()> {
        let client = self.client()?;
        client
            .flush()
            .await
            .map_err(|e| BusError::Publish(format!("Failed to flush: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let client = self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                warn!(connection = %self.name, error = %e, "Flush before close failed");
            }
        }
        self.observer.on_event(ConnectionEvent::Closed {
            name: self.name.clone(),
        });
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// NATS (queue) subscription.
pub struct NatsSubscription {
    subscriber: Option<async_nats::Subscriber>,
}

#[async_trait]
impl TransportSubscription for NatsSubscription {
    async fn next(&mut self) -> Option<RawMessage> {
        let subscriber = self.subscriber.as_mut()?;
        subscriber.next().await.map(from_nats)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        match self.subscriber.take() {
            Some(mut subscriber) => subscriber
                .unsubscribe()
                .await
                .map_err(|e| BusError::Subscribe(format!("Failed to unsubscribe: {}", e))),
            None => Ok(()),
        }
    }
}
