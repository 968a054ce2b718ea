//! Message broker abstraction
//!
//! AMQP (lapin) in production, an in-process broker in tests. Both expose
//! the same direct-exchange model: publish on (exchange, routing key), consume
//! from a queue with manual acknowledgement by delivery tag.

mod amqp;
#[cfg(test)]
mod memory;
mod routes;

pub use amqp::AmqpBroker;
#[cfg(test)]
pub use memory::MemoryBroker;
pub use routes::{RouteEntry, RouteTable, RouteTableError};

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Header carrying the numeric job id.
pub const HEADER_JOB_ID: &str = "IdNumber";
/// Header carrying the exchange the request was published on.
pub const HEADER_EXCHANGE: &str = "ExchangeName";

/// Body plus the properties and headers the relay cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    /// Reply routing key
    pub reply_to: Option<String>,
    pub job_id: Option<i64>,
    pub exchange: Option<String>,
}

/// A message handed out by the broker, awaiting ack or reject.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub envelope: Envelope,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("failed to declare {name}: {reason}")]
    Declare { name: String, reason: String },
    #[error("failed to publish to {exchange}/{routing_key}: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },
    #[error("failed to consume from {queue}: {reason}")]
    Consume { queue: String, reason: String },
    #[error("failed to settle delivery {delivery_tag}: {reason}")]
    Settle { delivery_tag: u64, reason: String },
    #[cfg(test)]
    #[error("unknown queue {0}")]
    UnknownQueue(String),
}

/// Broker operations used by the correlator and the dispatcher.
///
/// Implementations serialize every channel mutation (publish, ack, reject,
/// declarations) through a single exclusion point.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare the exchange, work queue, reply queue and their bindings.
    async fn declare(&self, route: &RouteEntry) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError>;

    /// Non-blocking get with manual acknowledgement; `None` when the queue is empty.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Push subscription with manual acknowledgement.
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Broker name for logging
    fn name(&self) -> &str;
}
