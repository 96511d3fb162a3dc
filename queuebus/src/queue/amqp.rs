//! AMQP 0-9-1 transport built on lapin.
//!
//! Batches are published inside an AMQP transaction on a dedicated channel so
//! either every message of a batch is enqueued or none is. Each subscription
//! gets its own channel; closing it hands unacknowledged deliveries back to
//! the broker.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::connection::ConnectionString;
use super::transport::{Subscription, Transport};
use super::types::{OutgoingMessage, ReceivedMessage, Settlement};
use crate::error::{QueueError, Result};

/// Header set by quorum queues with the number of earlier delivery attempts.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// AMQP connection plus a transactional publish channel.
pub struct AmqpTransport {
    connection: Connection,
    publish_channel: Mutex<Option<Channel>>,
}

impl AmqpTransport {
    pub async fn connect(connection_string: &ConnectionString) -> Result<Self> {
        info!(broker = %connection_string, "amqp_connecting");

        let connection =
            Connection::connect(connection_string.expose(), ConnectionProperties::default()).await?;

        info!(host = connection_string.host(), "amqp_connected");

        Ok(Self {
            connection,
            publish_channel: Mutex::new(None),
        })
    }

    /// Return the publish channel, opening a new one in transaction mode if needed.
    async fn ensure_publish_channel(&self, slot: &mut Option<Channel>) -> Result<Channel> {
        if let Some(ch) = slot.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        let ch = self.connection.create_channel().await?;
        ch.tx_select().await?;

        debug!(channel_id = ch.id(), "amqp_publish_channel_opened");

        *slot = Some(ch.clone());
        Ok(ch)
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

fn properties_for(message: &OutgoingMessage) -> BasicProperties {
    let mut properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
    if let Some(id) = &message.message_id {
        properties = properties.with_message_id(id.clone().into());
    }
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    properties
}

async fn publish_all(channel: &Channel, queue: &str, messages: &[OutgoingMessage]) -> Result<()> {
    for message in messages {
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties_for(message),
            )
            .await?
            .await?;
    }
    channel.tx_commit().await?;
    Ok(())
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn send_batch(&self, queue: &str, messages: Vec<OutgoingMessage>) -> Result<()> {
        // The slot stays locked for the whole transaction
        let mut slot = self.publish_channel.lock().await;
        let channel = self.ensure_publish_channel(&mut slot).await?;

        declare_queue(&channel, queue).await?;

        if let Err(e) = publish_all(&channel, queue, &messages).await {
            if let Err(rollback) = channel.tx_rollback().await {
                warn!(queue = queue, error = %rollback, "amqp_tx_rollback_failed");
            }
            return Err(e);
        }

        debug!(queue = queue, count = messages.len(), "amqp_batch_committed");
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Subscription>> {
        let channel = self.connection.create_channel().await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        declare_queue(&channel, queue).await?;

        // Empty tag lets the broker pick a unique one
        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = queue,
            prefetch_count = prefetch,
            consumer_tag = consumer.tag().as_str(),
            "amqp_consumer_started"
        );

        Ok(Box::new(AmqpSubscription { channel, consumer }))
    }

    async fn close(&self) -> Result<()> {
        if let Some(ch) = self.publish_channel.lock().await.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "amqp_publish_channel_close_error");
            }
        }

        self.connection.close(200, "Normal shutdown").await?;

        info!("amqp_connection_closed");
        Ok(())
    }
}

struct AmqpSubscription {
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_message(&mut self) -> Option<Result<ReceivedMessage>> {
        let delivery = self.consumer.next().await?;
        Some(delivery.map(into_received).map_err(QueueError::from))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let tag = self.consumer.tag();
        self.channel
            .basic_cancel(tag.as_str(), BasicCancelOptions::default())
            .await?;
        self.channel.close(200, "Normal shutdown").await?;

        debug!(consumer_tag = tag.as_str(), "amqp_consumer_closed");
        Ok(())
    }
}

struct AmqpSettlement {
    acker: Acker,
}

#[async_trait]
impl Settlement for AmqpSettlement {
    async fn complete(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn abandon(&self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

fn into_received(delivery: Delivery) -> ReceivedMessage {
    let delivery_count = delivery_count(&delivery);
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.to_string());

    ReceivedMessage::new(
        delivery.data,
        message_id,
        delivery_count,
        delivery.delivery_tag,
        Box::new(AmqpSettlement {
            acker: delivery.acker,
        }),
    )
}

/// Delivery attempt number, starting at 1.
///
/// Quorum queues report earlier attempts in `x-delivery-count`; classic queues
/// only expose the `redelivered` flag.
fn delivery_count(delivery: &Delivery) -> u32 {
    let previous = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
                .and_then(|(_, value)| header_as_u32(value))
        });

    match previous {
        Some(n) => n.saturating_add(1),
        None if delivery.redelivered => 2,
        None => 1,
    }
}

fn header_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_for_text_message() {
        let msg = OutgoingMessage::text("Message 1").with_message_id("message-1");
        let props = properties_for(&msg);
        assert_eq!(props.delivery_mode(), &Some(PERSISTENT));
        assert_eq!(
            props.message_id().as_ref().map(|s| s.as_str()),
            Some("message-1")
        );
        assert_eq!(
            props.content_type().as_ref().map(|s| s.as_str()),
            Some("text/plain")
        );
    }

    #[test]
    fn test_properties_without_optional_fields() {
        let props = properties_for(&OutgoingMessage::new(b"raw".to_vec()));
        assert!(props.message_id().is_none());
        assert!(props.content_type().is_none());
    }

    #[test]
    fn test_header_values() {
        assert_eq!(header_as_u32(&AMQPValue::LongLongInt(3)), Some(3));
        assert_eq!(header_as_u32(&AMQPValue::LongInt(-1)), None);
        assert_eq!(header_as_u32(&AMQPValue::ShortUInt(2)), Some(2));
        assert_eq!(header_as_u32(&AMQPValue::Boolean(true)), None);
    }
}
