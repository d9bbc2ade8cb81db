//! AMQP 0-9-1 broker (RabbitMQ) via lapin.

use super::{Acker, Delivery, DeliveryStream, MessageBroker, QueueName};
use crate::error::{Error, Result};
use futures::{stream, StreamExt};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::time::Duration;
use tokio::sync::Mutex;

/// Persistent delivery mode for published messages.
const PERSISTENT: u8 = 2;

struct Link {
    connection: Connection,
    channel: Channel,
}

/// RabbitMQ broker with a lazily (re)established connection.
///
/// The connection and publishing channel are opened on first use and reopened
/// whenever the broker reports them closed. Every new channel redeclares both
/// durable queues, so the broker never needs to be provisioned up front. The
/// publishing channel runs in confirm mode: a publish succeeds only once the
/// broker has acknowledged the message.
pub struct AmqpBroker {
    uri: String,
    link: Mutex<Option<Link>>,
}

impl AmqpBroker {
    pub fn new(uri: impl Into<String>) -> Self {
        AmqpBroker {
            uri: uri.into(),
            link: Mutex::new(None),
        }
    }

    async fn declare_queues(channel: &Channel) -> Result<()> {
        for queue in QueueName::ALL {
            channel
                .queue_declare(
                    queue.as_str(),
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }

    async fn open_channel(connection: &Connection) -> Result<Channel> {
        let channel = connection.create_channel().await?;
        Self::declare_queues(&channel).await?;
        Ok(channel)
    }

    async fn open_publish_channel(connection: &Connection) -> Result<Channel> {
        let channel = Self::open_channel(connection).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(channel)
    }

    /// Make `slot` hold a connected link, reconnecting or reopening the
    /// publishing channel as needed.
    async fn connect(&self, slot: &mut Option<Link>) -> Result<()> {
        if let Some(current) = slot.as_mut() {
            if current.connection.status().connected() {
                if !current.channel.status().connected() {
                    debug!("AMQP channel closed, reopening");
                    current.channel = Self::open_publish_channel(&current.connection).await?;
                }
                return Ok(());
            }
        }

        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = Self::open_publish_channel(&connection).await?;
        info!("✓ Connected to AMQP broker");
        *slot = Some(Link {
            connection,
            channel,
        });
        Ok(())
    }

    async fn channel(&self) -> Result<Channel> {
        let mut slot = self.link.lock().await;
        self.connect(&mut slot).await?;
        slot.as_ref()
            .map(|l| l.channel.clone())
            .ok_or_else(|| Error::Queue("AMQP link unavailable".to_string()))
    }

    /// Fresh channel on the shared connection, used for consuming.
    async fn consumer_channel(&self) -> Result<Channel> {
        let mut slot = self.link.lock().await;
        self.connect(&mut slot).await?;
        match slot.as_ref() {
            Some(l) => Self::open_channel(&l.connection).await,
            None => Err(Error::Queue("AMQP link unavailable".to_string())),
        }
    }
}

/// Map a publisher confirmation to the publish result.
fn confirmed(queue: QueueName, confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(Error::Queue(format!(
            "broker rejected publish to {}",
            queue
        ))),
        Confirmation::NotRequested => Err(Error::Queue(format!(
            "publish to {} was not confirmed",
            queue
        ))),
    }
}

/// Deliveries from `consumer`. The stream owns `channel` so the consumer's
/// channel stays open for as long as the stream is polled.
fn deliveries(channel: Channel, consumer: Consumer) -> DeliveryStream {
    stream::unfold((channel, consumer), |(channel, mut consumer)| async move {
        let item = consumer.next().await?;
        let delivery = item.map(Delivery::from_amqp).map_err(Into::into);
        Some((delivery, (channel, consumer)))
    })
    .boxed()
}

impl Delivery {
    fn from_amqp(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            payload: delivery.data,
            redelivered: delivery.redelivered,
            acker: Acker::Amqp(delivery.acker),
        }
    }
}

impl MessageBroker for AmqpBroker {
    async fn publish(&self, queue: QueueName, payload: Vec<u8>) -> Result<()> {
        let channel = self.channel().await?;
        let confirm = channel
            .basic_publish(
                "",
                queue.as_str(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?;
        confirmed(queue, confirm.await?)
    }

    async fn queue_depth(&self, queue: QueueName) -> Result<u64> {
        let channel = self.channel().await?;
        let declared = channel
            .queue_declare(
                queue.as_str(),
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(u64::from(declared.message_count()))
    }

    async fn subscribe(&self, queue: QueueName) -> Result<DeliveryStream> {
        // Consumers get their own channel so prefetch applies per queue.
        let channel = self.consumer_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let consumer = channel
            .basic_consume(
                queue.as_str(),
                &format!("applier-{}", queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!("✓ Consuming {}", queue);

        Ok(deliveries(channel, consumer))
    }

    async fn probe(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.channel()).await,
            Ok(Ok(_))
        )
    }

    async fn close(&self) -> Result<()> {
        if let Some(link) = self.link.lock().await.take() {
            if link.channel.status().connected() {
                link.channel.close(200, "OK").await?;
            }
            if link.connection.status().connected() {
                link.connection.close(200, "OK").await?;
            }
            info!("✓ AMQP connection closed");
        }
        Ok(())
    }
}
