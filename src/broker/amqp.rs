//! RabbitMQ broker client built on lapin
//!
//! One connection, one channel. The channel is not safe for unsynchronized
//! concurrent use, so every operation on it takes the channel mutex.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    BrokerError, Delivery, DeliveryStream, Envelope, MessageBroker, RouteEntry, HEADER_EXCHANGE,
    HEADER_JOB_ID,
};

/// Unacknowledged deliveries the broker pushes to one consumer at a time.
const PREFETCH_COUNT: u16 = 1;

pub struct AmqpBroker {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
}

impl AmqpBroker {
    /// Open a connection and a channel. Pair with [`AmqpBroker::close`].
    pub async fn connect(url: &str, connection_name: &str) -> Result<Self, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_string()));
        let connection = Connection::connect(url, properties)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to create channel: {e}")))?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to set prefetch: {e}")))?;

        info!("Connected to AMQP broker as '{}'", connection_name);

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    /// Closing the connection closes the channel with it.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let _channel = self.channel.lock().await;
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to close connection: {e}")))?;
        info!("AMQP connection closed");
        Ok(())
    }

    async fn declare_queue(&self, channel: &Channel, queue: &str) -> Result<(), BrokerError> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                name: queue.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn bind(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        key: &str,
    ) -> Result<(), BrokerError> {
        channel
            .queue_bind(queue, exchange, key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BrokerError::Declare {
                name: format!("{queue} <- {exchange}/{key}"),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn declare(&self, route: &RouteEntry) -> Result<(), BrokerError> {
        let channel = self.channel.lock().await;

        channel
            .exchange_declare(
                &route.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                name: route.exchange.clone(),
                reason: e.to_string(),
            })?;

        self.declare_queue(&channel, &route.work_queue).await?;
        self.declare_queue(&channel, &route.reply_queue).await?;
        self.bind(&channel, &route.work_queue, &route.exchange, &route.routing_key)
            .await?;
        self.bind(&channel, &route.reply_queue, &route.exchange, &route.reply_routing_key)
            .await?;

        debug!("Declared routes for {}", route.problem_type);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        let properties = to_properties(&envelope);
        let channel = self.channel.lock().await;

        let publish_error = |reason: String| BrokerError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason,
        };

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(format!("confirmation failed: {e}")))?;

        debug!("Published {} bytes to {}/{}", envelope.body.len(), exchange, routing_key);
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let channel = self.channel.lock().await;
        let message = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        Ok(message.map(|m| Delivery {
            delivery_tag: m.delivery.delivery_tag,
            envelope: from_properties(&m.delivery.properties, m.delivery.data),
        }))
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = {
            let channel = self.channel.lock().await;
            channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Consume {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })?
        };

        info!("Consumer '{}' subscribed to {}", consumer_tag, queue);

        let queue = queue.to_string();
        let stream = consumer.map(move |item| match item {
            Ok(delivery) => Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                envelope: from_properties(&delivery.properties, delivery.data),
            }),
            Err(e) => Err(BrokerError::Consume {
                queue: queue.clone(),
                reason: e.to_string(),
            }),
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle {
                delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let channel = self.channel.lock().await;
        channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Settle {
                delivery_tag,
                reason: e.to_string(),
            })
    }

    fn name(&self) -> &str {
        "amqp"
    }
}

fn to_properties(envelope: &Envelope) -> BasicProperties {
    let mut headers = FieldTable::default();
    if let Some(job_id) = envelope.job_id {
        headers.insert(
            ShortString::from(HEADER_JOB_ID.to_string()),
            AMQPValue::LongLongInt(job_id),
        );
    }
    if let Some(exchange) = &envelope.exchange {
        headers.insert(
            ShortString::from(HEADER_EXCHANGE.to_string()),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from("application/json".to_string()))
        .with_headers(headers);
    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &envelope.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    properties
}

fn from_properties(properties: &BasicProperties, body: Vec<u8>) -> Envelope {
    let header = |name: &str| {
        properties.headers().as_ref().and_then(|table| {
            table
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == name)
                .map(|(_, value)| value.clone())
        })
    };

    Envelope {
        body,
        correlation_id: properties.correlation_id().as_ref().map(|c| c.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|r| r.as_str().to_string()),
        job_id: header(HEADER_JOB_ID).as_ref().and_then(header_integer),
        exchange: header(HEADER_EXCHANGE).as_ref().and_then(header_string),
    }
}

fn header_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}

fn header_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => String::from_utf8(s.as_bytes().to_vec()).ok(),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}
