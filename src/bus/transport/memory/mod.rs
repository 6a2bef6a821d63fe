//! In-process broker.
//!
//! Implements the subset of broker semantics the bus relies on:
//! - plain subscriptions receive every message on their subject
//! - queue subscriptions sharing a group receive each message once, round-robin
//! - request/reply through one-shot inbox subjects
//! - connection drops with reconnect attempts driven by the `ReconnectPolicy`
//!
//! Ideal for local development and testing without external dependencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::{ConnectOptions, Connector, RawMessage, Transport, TransportSubscription};
use crate::bus::connection::{ConnectionEvent, ConnectionObserver, ReconnectPolicy};
use crate::bus::{BusError, Result};

/// Prefix of reply inbox subjects.
const INBOX_PREFIX: &str = "_INBOX.";

/// URL reported in reconnect events.
const MEMORY_URL: &str = "memory://local";

/// Subscriptions opened through one connection, as `(subject, id)`.
type Tracked = Arc<Mutex<Vec<(String, u64)>>>;

struct SubEntry {
    id: u64,
    group: Option<String>,
    online: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<RawMessage>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: HashMap<String, Vec<SubEntry>>,
    group_cursors: HashMap<(String, String), usize>,
    inboxes: HashMap<String, oneshot::Sender<RawMessage>>,
    connections: Vec<Weak<MemoryConnection>>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    next_id: AtomicU64,
}

/// Shared in-process broker. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Connector dialing this broker.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector::new(self.clone())
    }

    /// Make the broker reachable or unreachable for new dials and reconnects.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Drop every live connection; each one starts reconnecting per its policy.
    pub fn drop_connections(&self) {
        let connections: Vec<Arc<MemoryConnection>> = {
            let mut state = self.lock();
            state.connections.retain(|c| c.strong_count() > 0);
            state.connections.iter().filter_map(Weak::upgrade).collect()
        };
        for conn in connections {
            conn.disconnect("connection reset by broker");
        }
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.lock()
            .subscriptions
            .get(subject)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register_connection(&self, conn: &Arc<MemoryConnection>) {
        let mut state = self.lock();
        state.connections.retain(|c| c.strong_count() > 0);
        state.connections.push(Arc::downgrade(conn));
    }

    fn add_subscription(
        &self,
        subject: &str,
        group: Option<&str>,
        online: Arc<AtomicBool>,
    ) -> (u64, mpsc::UnboundedReceiver<RawMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        self.lock()
            .subscriptions
            .entry(subject.to_string())
            .or_default()
            .push(SubEntry {
                id,
                group: group.map(str::to_string),
                online,
                tx,
            });
        (id, rx)
    }

    fn remove_subscription(&self, subject: &str, id: u64) {
        let mut state = self.lock();
        if let Some(subs) = state.subscriptions.get_mut(subject) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                state.subscriptions.remove(subject);
            }
        }
    }

    fn open_inbox(&self) -> (String, oneshot::Receiver<RawMessage>) {
        let inbox = format!("{}{}", INBOX_PREFIX, uuid::Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        self.lock().inboxes.insert(inbox.clone(), tx);
        (inbox, rx)
    }

    fn close_inbox(&self, inbox: &str) {
        self.lock().inboxes.remove(inbox);
    }

    /// Deliver `message` to matching subscribers. Returns the delivery count.
    fn route(&self, message: RawMessage) -> usize {
        let mut state = self.lock();

        if message.subject.starts_with(INBOX_PREFIX) {
            if let Some(waiter) = state.inboxes.remove(&message.subject) {
                return usize::from(waiter.send(message).is_ok());
            }
        }

        let BrokerState {
            subscriptions,
            group_cursors,
            ..
        } = &mut *state;

        let Some(subs) = subscriptions.get_mut(&message.subject) else {
            return 0;
        };
        subs.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        let mut groups: Vec<String> = Vec::new();
        for sub in subs.iter() {
            match &sub.group {
                None => {
                    if sub.online.load(Ordering::SeqCst) && sub.tx.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                Some(group) => {
                    if !groups.contains(group) {
                        groups.push(group.clone());
                    }
                }
            }
        }

        for group in groups {
            let members: Vec<&SubEntry> = subs
                .iter()
                .filter(|s| s.group.as_ref() == Some(&group) && s.online.load(Ordering::SeqCst))
                .collect();
            if members.is_empty() {
                continue;
            }
            let cursor = group_cursors
                .entry((message.subject.clone(), group))
                .or_insert(0);
            let start = *cursor;
            *cursor = cursor.wrapping_add(1);
            for offset in 0..members.len() {
                let member = members[(start + offset) % members.len()];
                if member.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                    break;
                }
            }
        }

        trace!(subject = %message.subject, delivered, "Routed message");
        delivered
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Dials a `MemoryBroker`.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    connect_delay: Duration,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            connect_delay: Duration::ZERO,
        }
    }

    /// Simulate a slow dial.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    async fn open(
        &self,
        options: &ConnectOptions,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<MemoryConnection>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if !self.broker.is_available() {
            return Err(BusError::Connection(format!(
                "Failed to connect '{}': broker unavailable",
                options.name
            )));
        }

        let conn = Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            name: options.name.clone(),
            policy: options.reconnect,
            observer,
            closed: AtomicBool::new(false),
            online: Arc::new(AtomicBool::new(true)),
            subscriptions: Tracked::default(),
        });
        self.broker.register_connection(&conn);
        debug!(connection = %options.name, "Memory connection opened");
        Ok(conn)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn Transport>> {
        let conn: Arc<dyn Transport> = self.open(options, observer).await?;
        Ok(conn)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Connection to a `MemoryBroker`.
pub struct MemoryConnection {
    broker: MemoryBroker,
    name: String,
    policy: ReconnectPolicy,
    observer: Arc<dyn ConnectionObserver>,
    closed: AtomicBool,
    online: Arc<AtomicBool>,
    subscriptions: Tracked,
}

impl MemoryConnection {
    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed("connection"));
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(BusError::Publish(format!(
                "connection '{}' is reconnecting",
                self.name
            )));
        }
        Ok(())
    }

    fn disconnect(self: Arc<Self>, reason: &str) {
        if self.is_closed() || !self.online.swap(false, Ordering::SeqCst) {
            return;
        }
        self.observer.on_event(ConnectionEvent::Disconnected {
            name: self.name.clone(),
            error: Some(reason.to_string()),
        });

        let conn = self;
        tokio::spawn(async move {
            for delay in conn.policy.backoff().build() {
                tokio::time::sleep(delay).await;
                if conn.is_closed() {
                    return;
                }
                if conn.broker.is_available() {
                    conn.online.store(true, Ordering::SeqCst);
                    conn.observer.on_event(ConnectionEvent::Reconnected {
                        name: conn.name.clone(),
                        url: MEMORY_URL.to_string(),
                    });
                    return;
                }
            }
            debug!(connection = %conn.name, "Reconnect budget exhausted");
            let _ = conn.close().await;
        });
    }
}

#[async_trait]
impl Transport for MemoryConnection {
    async fn publish(&self, message: RawMessage) -> Result<()> {
        self.ensure_usable()?;
        self.broker.route(message);
        Ok(())
    }

    async fn request(&self, mut message: RawMessage, timeout: Duration) -> Result<RawMessage> {
        self.ensure_usable()?;
        let topic = message.subject.clone();
        let (inbox, rx) = self.broker.open_inbox();
        message.reply = Some(inbox.clone());
        self.broker.route(message);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) | Err(_) => {
                self.broker.close_inbox(&inbox);
                Err(BusError::AckTimeout { topic, timeout })
            }
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn TransportSubscription>> {
        if self.is_closed() {
            return Err(BusError::Closed("connection"));
        }
        let (id, rx) = self
            .broker
            .add_subscription(subject, queue_group, Arc::clone(&self.online));
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((subject.to_string(), id));

        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            tracked: Arc::clone(&self.subscriptions),
            subject: subject.to_string(),
            id,
            rx,
            active: true,
        }))
    }

    async fn respond(&self, reply: &str, payload: Bytes) -> Result<()> {
        self.ensure_usable()?;
        self.broker.route(RawMessage::new(reply, payload));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_usable()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for (subject, id) in subscriptions {
            self.broker.remove_subscription(&subject, id);
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

/// Subscription on a `MemoryBroker`.
pub struct MemorySubscription {
    broker: MemoryBroker,
    tracked: Tracked,
    subject: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<RawMessage>,
    active: bool,
}

#[async_trait]
impl TransportSubscription for MemorySubscription {
    async fn next(&mut self) -> Option<RawMessage> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if self.active {
            self.release();
            self.rx.close();
        }
        Ok(())
    }
}

impl MemorySubscription {
    fn release(&mut self) {
        self.active = false;
        self.broker.remove_subscription(&self.subject, self.id);
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(_, id)| *id != self.id);
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if self.active {
            self.release();
        }
    }
}
