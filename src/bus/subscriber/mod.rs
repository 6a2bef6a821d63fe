//! Subscriber with concurrent workers and reply-based ack/nack.
//!
//! Each subscription runs `subscribers_count` workers. A worker owns one
//! broker-level (queue) subscription and processes its messages strictly in
//! delivery order:
//!
//! ```text
//! broker ──> unmarshal ──> output channel ──> consumer
//!                                                │ ack / nack
//! broker <── "OK" / "Nacked" reply <─────────────┘
//! ```
//!
//! A worker never replies before the consumer has taken the message from the
//! output channel. Messages whose subscription is cancelled before a decision
//! are abandoned without any reply and left to the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::codec::{HeaderMarshaler, Unmarshaler};
use super::connection::{Connection, ConnectionFactory};
use super::context::Context;
use super::message::{AckDecision, Message};
use super::transport::{RawMessage, TransportSubscription};
use super::{BusError, Result, Subscriber, ACK_REPLY, NACK_REPLY, UNMARSHAL_REPLY};
use crate::config::SubscriberConfig;

/// Workers and context of one `subscribe` call.
struct ActiveSubscription {
    topic: String,
    ctx: Context,
    workers: Vec<JoinHandle<()>>,
}

impl ActiveSubscription {
    fn is_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }
}

/// Subscriber built on request/reply acknowledgments.
pub struct AckSubscriber {
    config: SubscriberConfig,
    connection: Connection,
    owns_connection: bool,
    unmarshaler: Arc<dyn Unmarshaler>,
    /// Cancelled once `close` starts; workers stop taking new messages.
    closing: Context,
    closed: AtomicBool,
    subscriptions: RwLock<Vec<ActiveSubscription>>,
}

impl AckSubscriber {
    /// Create a subscriber on an existing connection.
    ///
    /// Fails if the configuration would duplicate deliveries (several
    /// workers without a queue group).
    pub fn new(config: SubscriberConfig, connection: Connection) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connection,
            owns_connection: false,
            unmarshaler: Arc::new(HeaderMarshaler),
            closing: Context::background(),
            closed: AtomicBool::new(false),
            subscriptions: RwLock::new(Vec::new()),
        })
    }

    /// Create a subscriber whose connection comes from `factory`.
    pub async fn connect(
        factory: &ConnectionFactory,
        name: &str,
        config: SubscriberConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (connection, owned) = factory.connection_for(name).await?;
        let mut subscriber = Self::new(config, connection)?;
        subscriber.owns_connection = owned;
        Ok(subscriber)
    }

    /// Replace the wire codec.
    pub fn with_unmarshaler(mut self, unmarshaler: Arc<dyn Unmarshaler>) -> Self {
        self.unmarshaler = unmarshaler;
        self
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Topics of subscriptions whose workers are still running.
    pub fn active_topics(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| !s.is_finished())
            .map(|s| s.topic.clone())
            .collect()
    }

    /// Check that `topic` can be subscribed with the configured queue group,
    /// without consuming anything.
    pub async fn subscribe_initialize(&self, topic: &str) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed("subscriber"));
        }
        let mut subscription = self
            .connection
            .subscribe(topic, self.config.queue_group())
            .await?;
        subscription.unsubscribe().await?;
        debug!(topic = %topic, queue_group = ?self.config.queue_group(), "Subscription initialized");
        Ok(())
    }
}

#[async_trait]
impl Subscriber for AckSubscriber {
    async fn subscribe(&self, ctx: &Context, topic: &str) -> Result<mpsc::Receiver<Message>> {
        if self.is_closed() {
            return Err(BusError::Closed("subscriber"));
        }

        let ctx = ctx.child();
        let group = self.config.queue_group();
        let count = self.config.subscribers_count;

        let mut broker_subscriptions = Vec::with_capacity(count);
        for _ in 0..count {
            match self.connection.subscribe(topic, group).await {
                Ok(subscription) => broker_subscriptions.push(subscription),
                Err(e) => {
                    for mut subscription in broker_subscriptions {
                        let _ = subscription.unsubscribe().await;
                    }
                    return Err(e);
                }
            }
        }

        let (output, rx) = mpsc::channel(self.config.output_buffer);
        let workers = broker_subscriptions
            .into_iter()
            .enumerate()
            .map(|(id, subscription)| {
                let worker = Worker {
                    id,
                    subscription,
                    handler: MessageHandler {
                        topic: topic.to_string(),
                        connection: Arc::clone(&self.connection),
                        unmarshaler: Arc::clone(&self.unmarshaler),
                        output: output.clone(),
                        ctx: ctx.clone(),
                        closing: self.closing.clone(),
                    },
                };
                tokio::spawn(worker.run())
            })
            .collect();

        {
            let mut subscriptions = self
                .subscriptions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscriptions.retain(|s| !s.is_finished());
            subscriptions.push(ActiveSubscription {
                topic: topic.to_string(),
                ctx: ctx.clone(),
                workers,
            });
        }

        // Lost a race with close(): make sure these workers stop too.
        if self.is_closed() {
            ctx.cancel();
            return Err(BusError::Closed("subscriber"));
        }

        info!(
            topic = %topic,
            queue_group = ?group,
            workers = count,
            "Subscribed"
        );
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closing.cancel();

        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut contexts = Vec::with_capacity(subscriptions.len());
        let mut workers = Vec::new();
        for subscription in subscriptions {
            contexts.push(subscription.ctx);
            workers.extend(subscription.workers);
        }

        let mut drain = Box::pin(futures::future::join_all(workers));
        let timeout = self.config.close_timeout();
        if tokio::time::timeout(timeout, drain.as_mut()).await.is_err() {
            warn!(
                timeout_ms = %timeout.as_millis(),
                "Close timeout elapsed, abandoning in-flight messages"
            );
            for ctx in &contexts {
                ctx.cancel();
            }
            drain.await;
        }
        for ctx in &contexts {
            ctx.cancel();
        }

        if self.owns_connection {
            self.connection.close().await?;
        }
        info!("Subscriber closed");
        Ok(())
    }
}

/// One consume loop bound to one broker-level subscription.
struct Worker {
    id: usize,
    subscription: Box<dyn TransportSubscription>,
    handler: MessageHandler,
}

impl Worker {
    async fn run(mut self) {
        let topic = self.handler.topic.clone();
        debug!(topic = %topic, worker = self.id, "Worker started");
        loop {
            let raw = tokio::select! {
                biased;
                _ = self.handler.closing.cancelled() => break,
                _ = self.handler.ctx.cancelled() => break,
                _ = self.handler.output.closed() => {
                    debug!(topic = %topic, worker = self.id, "Output channel dropped by consumer");
                    break;
                }
                raw = self.subscription.next() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };
            if self.handler.process(raw).await == Flow::Stop {
                break;
            }
        }

        if let Err(e) = self.subscription.unsubscribe().await {
            warn!(topic = %topic, worker = self.id, error = %e, "Failed to unsubscribe");
        }
        debug!(topic = %topic, worker = self.id, "Worker stopped");
    }
}

/// Whether a worker keeps consuming after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Per-message processing shared by a worker's loop iterations.
struct MessageHandler {
    topic: String,
    connection: Connection,
    unmarshaler: Arc<dyn Unmarshaler>,
    output: mpsc::Sender<Message>,
    ctx: Context,
    closing: Context,
}

impl MessageHandler {
    async fn process(&self, raw: RawMessage) -> Flow {
        if self.closing.is_cancelled() {
            trace!(topic = %self.topic, "Subscriber closing, dropping message");
            return Flow::Stop;
        }

        let message = match self.unmarshaler.unmarshal(&raw) {
            Ok(message) => message,
            Err(e) => {
                error!(topic = %self.topic, error = %e, "Cannot unmarshal message");
                if let Some(reply) = raw.reply.as_deref() {
                    self.reply(reply, format!("{}: {}", UNMARSHAL_REPLY, e))
                        .await;
                }
                return Flow::Continue;
            }
        };

        let message_ctx = self.ctx.child();
        let (message, decision) = message.into_delivery(message_ctx.clone());
        let uuid = message.uuid.clone();

        tokio::select! {
            sent = self.output.send(message) => {
                if sent.is_err() {
                    debug!(topic = %self.topic, uuid = %uuid, "Output channel closed, message discarded");
                    message_ctx.cancel();
                    return Flow::Stop;
                }
            }
            _ = self.closing.cancelled() => {
                trace!(topic = %self.topic, uuid = %uuid, "Subscriber closing, message discarded");
                message_ctx.cancel();
                return Flow::Stop;
            }
            _ = self.ctx.cancelled() => {
                trace!(topic = %self.topic, uuid = %uuid, "Subscription cancelled, message discarded");
                return Flow::Stop;
            }
        }

        let outcome = tokio::select! {
            decision = decision => decision.ok(),
            _ = self.ctx.cancelled() => None,
        };

        match outcome {
            Some(AckDecision::Ack) => {
                if let Some(reply) = raw.reply.as_deref() {
                    self.reply(reply, ACK_REPLY.to_string()).await;
                }
                trace!(topic = %self.topic, uuid = %uuid, "Message acked");
            }
            Some(AckDecision::Nack) => {
                if let Some(reply) = raw.reply.as_deref() {
                    self.reply(reply, NACK_REPLY.to_string()).await;
                }
                debug!(topic = %self.topic, uuid = %uuid, "Message nacked");
            }
            None => {
                debug!(topic = %self.topic, uuid = %uuid, "Message abandoned without ack");
            }
        }
        message_ctx.cancel();
        Flow::Continue
    }

    async fn reply(&self, reply: &str, payload: String) {
        if let Err(e) = self.connection.respond(reply, Bytes::from(payload)).await {
            error!(topic = %self.topic, error = %e, "Failed to send reply");
        }
    }
}
