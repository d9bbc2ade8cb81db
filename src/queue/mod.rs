//! Durable write-intent channel between the gateway and the applier.
//!
//! Two named queues carry [`Intent`]s: `add_key` with `{key, value}` payloads
//! and `del_key` with `{key}` payloads. Brokers deliver at least once, so
//! everything downstream must tolerate redelivery.

use crate::config::{QueueConfig, QueueEngine};
use crate::error::{Error, Result};
use crate::observability::Metrics;
use crate::policy::{self, Operation};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;

/// The two named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    AddKey,
    DelKey,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::AddKey, QueueName::DelKey];

    pub const fn as_str(self) -> &'static str {
        match self {
            QueueName::AddKey => "add_key",
            QueueName::DelKey => "del_key",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write or delete waiting to be applied. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Intent {
    Add { key: String, value: String },
    Delete { key: String },
}

#[derive(Deserialize)]
struct AddPayload {
    key: String,
    value: Value,
}

#[derive(Deserialize)]
struct DeletePayload {
    key: String,
}

/// Text form of a JSON scalar value.
///
/// Strings are taken verbatim; numbers and booleans become their JSON text.
/// `null`, arrays and objects have no text form.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

impl Intent {
    /// Queue this intent is routed to.
    pub fn queue(&self) -> QueueName {
        match self {
            Intent::Add { .. } => QueueName::AddKey,
            Intent::Delete { .. } => QueueName::DelKey,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Intent::Add { key, .. } | Intent::Delete { key } => key,
        }
    }

    /// Wire payload: `{"key":..,"value":..}` or `{"key":..}`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a payload received from `queue`.
    ///
    /// # Errors
    /// Returns `Error::Payload` for invalid JSON, missing fields, an empty key
    /// or a value without a text form.
    pub fn decode(queue: QueueName, payload: &[u8]) -> Result<Self> {
        let intent = match queue {
            QueueName::AddKey => {
                let p: AddPayload = serde_json::from_slice(payload)?;
                let value = scalar_text(&p.value).ok_or_else(|| {
                    Error::Payload(format!("value for key '{}' is not a scalar", p.key))
                })?;
                Intent::Add { key: p.key, value }
            }
            QueueName::DelKey => {
                let p: DeletePayload = serde_json::from_slice(payload)?;
                Intent::Delete { key: p.key }
            }
        };

        if intent.key().is_empty() {
            return Err(Error::Payload("empty key".to_string()));
        }
        Ok(intent)
    }
}

/// Message handed to a consumer; must be acknowledged once handled.
pub struct Delivery {
    payload: Vec<u8>,
    redelivered: bool,
    acker: Acker,
}

enum Acker {
    Memory(memory::PendingAck),
    #[cfg(feature = "amqp")]
    Amqp(lapin::acker::Acker),
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge the message so the broker forgets it.
    pub async fn ack(self) -> Result<()> {
        match self.acker {
            Acker::Memory(pending) => {
                pending.ack();
                Ok(())
            }
            #[cfg(feature = "amqp")]
            Acker::Amqp(acker) => {
                acker
                    .ack(lapin::options::BasicAckOptions::default())
                    .await?;
                Ok(())
            }
        }
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Broker operations used by the producer, the applier and health checks.
pub trait MessageBroker: Send + Sync + 'static {
    /// Publish `payload` durably to `queue`.
    fn publish(&self, queue: QueueName, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Messages waiting in `queue`, not counting unacknowledged ones.
    fn queue_depth(&self, queue: QueueName) -> impl Future<Output = Result<u64>> + Send;

    /// Start consuming `queue`, at most one unacknowledged delivery at a time.
    fn subscribe(&self, queue: QueueName) -> impl Future<Output = Result<DeliveryStream>> + Send;

    /// Whether a channel can be obtained within `timeout`.
    fn probe(&self, timeout: Duration) -> impl Future<Output = bool> + Send;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The broker selected by configuration.
pub enum Broker {
    Memory(InMemoryBroker),
    #[cfg(feature = "amqp")]
    Amqp(AmqpBroker),
}

impl Broker {
    /// Build the configured broker. No connection is made yet.
    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        match config.engine {
            QueueEngine::Memory => Ok(Broker::Memory(InMemoryBroker::new())),
            #[cfg(feature = "amqp")]
            QueueEngine::Amqp => Ok(Broker::Amqp(AmqpBroker::new(config.uri()))),
            #[cfg(not(feature = "amqp"))]
            QueueEngine::Amqp => Err(Error::Config(
                "queue backend 'amqp' is not compiled in".to_string(),
            )),
        }
    }
}

impl MessageBroker for Broker {
    async fn publish(&self, queue: QueueName, payload: Vec<u8>) -> Result<()> {
        match self {
            Broker::Memory(b) => b.publish(queue, payload).await,
            #[cfg(feature = "amqp")]
            Broker::Amqp(b) => b.publish(queue, payload).await,
        }
    }

    async fn queue_depth(&self, queue: QueueName) -> Result<u64> {
        match self {
            Broker::Memory(b) => b.queue_depth(queue).await,
            #[cfg(feature = "amqp")]
            Broker::Amqp(b) => b.queue_depth(queue).await,
        }
    }

    async fn subscribe(&self, queue: QueueName) -> Result<DeliveryStream> {
        match self {
            Broker::Memory(b) => b.subscribe(queue).await,
            #[cfg(feature = "amqp")]
            Broker::Amqp(b) => b.subscribe(queue).await,
        }
    }

    async fn probe(&self, timeout: Duration) -> bool {
        match self {
            Broker::Memory(b) => b.probe(timeout).await,
            #[cfg(feature = "amqp")]
            Broker::Amqp(b) => b.probe(timeout).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Broker::Memory(b) => b.close().await,
            #[cfg(feature = "amqp")]
            Broker::Amqp(b) => b.close().await,
        }
    }
}

/// Publishing side of the channel.
///
/// A failed publish is returned to the caller: until the applier persists it,
/// the queued intent is the only record that the write happened.
pub struct QueueProducer<Q: MessageBroker> {
    broker: Arc<Q>,
    metrics: Arc<dyn Metrics>,
}

impl<Q: MessageBroker> QueueProducer<Q> {
    pub fn new(broker: Arc<Q>, metrics: Arc<dyn Metrics>) -> Self {
        QueueProducer { broker, metrics }
    }

    /// Serialize `payload` and publish it to `queue`.
    ///
    /// # Errors
    /// Returns `Error::Payload` if `payload` cannot be serialized and
    /// `Error::Queue` if the broker refuses or is unreachable.
    pub async fn send<T: Serialize + ?Sized>(&self, queue: QueueName, payload: &T) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let timer = Instant::now();

        policy::settle(Operation::QueuePublish, self.broker.publish(queue, body).await)?;

        self.metrics.publish_latency(queue.as_str(), timer.elapsed());
        debug!("✓ Published to {} in {:?}", queue, timer.elapsed());

        self.refresh_depths().await;
        Ok(())
    }

    /// Publish an intent to the queue it routes to.
    pub async fn submit(&self, intent: &Intent) -> Result<()> {
        self.send(intent.queue(), intent).await
    }

    /// Refresh the depth gauge of every named queue. Failures are ignored.
    async fn refresh_depths(&self) {
        for queue in QueueName::ALL {
            let depth = policy::settle(
                Operation::QueueDepthRefresh,
                self.broker.queue_depth(queue).await,
            );
            if let Ok(Some(depth)) = depth {
                self.metrics.queue_depth(queue.as_str(), depth);
            }
        }
    }

    pub fn broker(&self) -> &Arc<Q> {
        &self.broker
    }
}
