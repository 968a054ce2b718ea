//! In-process broker with direct-exchange semantics
//!
//! Test double for RabbitMQ, so the gateway, dispatcher and correlator can be
//! exercised end to end in unit tests. State lives behind one mutex, which
//! plays the role of the single AMQP channel.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::debug;

use super::{BrokerError, Delivery, DeliveryStream, Envelope, MessageBroker, RouteEntry};

type Subscriber = UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Default)]
struct State {
    /// (exchange, routing key) -> queue
    bindings: HashMap<(String, String), String>,
    queues: HashMap<String, VecDeque<Delivery>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    /// delivery tag -> (queue, delivery) for handed-out, unsettled messages
    unacked: HashMap<u64, (String, Delivery)>,
    acked: Vec<u64>,
    rejected: Vec<(u64, bool)>,
    next_tag: u64,
}

impl State {
    /// Hand `delivery` to a live subscriber of `queue`, or park it in the queue.
    fn route_to(&mut self, queue: &str, delivery: Delivery) {
        if let Some(subscribers) = self.subscribers.get_mut(queue) {
            subscribers.retain(|s| !s.is_closed());
            if let Some(subscriber) = subscribers.first() {
                if subscriber.unbounded_send(Ok(delivery.clone())).is_ok() {
                    self.unacked.insert(delivery.delivery_tag, (queue.to_string(), delivery));
                    return;
                }
            }
        }
        self.queues.entry(queue.to_string()).or_default().push_back(delivery);
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting in `queue` (not yet handed out).
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Take every waiting message from `queue` without acknowledgement bookkeeping.
    pub fn take_all(&self, queue: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).map(|d| d.envelope).collect())
            .unwrap_or_default()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().acked.clone()
    }

    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.state.lock().rejected.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare(&self, route: &RouteEntry) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        for queue in [&route.work_queue, &route.reply_queue] {
            state.queues.entry(queue.clone()).or_default();
        }
        state.bindings.insert(
            (route.exchange.clone(), route.routing_key.clone()),
            route.work_queue.clone(),
        );
        state.bindings.insert(
            (route.exchange.clone(), route.reply_routing_key.clone()),
            route.reply_queue.clone(),
        );
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let Some(queue) = state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
        else {
            // Unroutable messages are dropped, as a direct exchange does.
            debug!("No binding for {}/{}, message dropped", exchange, routing_key);
            return Ok(());
        };

        state.next_tag += 1;
        let delivery = Delivery {
            delivery_tag: state.next_tag,
            envelope,
        };
        state.route_to(&queue, delivery);
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.state.lock();
        let delivery = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?
            .pop_front();
        if let Some(delivery) = &delivery {
            state
                .unacked
                .insert(delivery.delivery_tag, (queue.to_string(), delivery.clone()));
        }
        Ok(delivery)
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let (sender, receiver) = unbounded();
        let mut state = self.state.lock();
        let waiting: Vec<Delivery> = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?
            .drain(..)
            .collect();

        state.subscribers.entry(queue.to_string()).or_default().push(sender);
        for delivery in waiting {
            state.route_to(queue, delivery);
        }
        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.unacked.remove(&delivery_tag).ok_or(BrokerError::Settle {
            delivery_tag,
            reason: "unknown delivery tag".to_string(),
        })?;
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let (queue, delivery) = state.unacked.remove(&delivery_tag).ok_or(BrokerError::Settle {
            delivery_tag,
            reason: "unknown delivery tag".to_string(),
        })?;
        state.rejected.push((delivery_tag, requeue));
        if requeue {
            state.route_to(&queue, delivery);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProblemType;

    fn route() -> RouteEntry {
        RouteEntry::new(ProblemType::Vrp, "ex", "work", "key", "reply", "reply-key")
    }

    fn envelope(body: &str) -> Envelope {
        Envelope {
            body: body.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_routes_by_binding_and_fetch_drains_in_order() {
        let broker = MemoryBroker::new();
        broker.declare(&route()).await.unwrap();

        broker.publish("ex", "key", envelope("a")).await.unwrap();
        broker.publish("ex", "key", envelope("b")).await.unwrap();
        broker.publish("ex", "reply-key", envelope("r")).await.unwrap();

        assert_eq!(broker.queue_len("work"), 2);
        assert_eq!(broker.queue_len("reply"), 1);

        let first = broker.fetch("work").await.unwrap().unwrap();
        let second = broker.fetch("work").await.unwrap().unwrap();
        assert_eq!(first.envelope.body, b"a");
        assert_eq!(second.envelope.body, b"b");
        assert!(broker.fetch("work").await.unwrap().is_none());
        assert_eq!(broker.unacked_count(), 2);
    }

    #[tokio::test]
    async fn unroutable_publish_is_dropped() {
        let broker = MemoryBroker::new();
        broker.declare(&route()).await.unwrap();
        broker.publish("ex", "nowhere", envelope("x")).await.unwrap();
        assert_eq!(broker.queue_len("work"), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_backlog_and_new_messages() {
        let broker = MemoryBroker::new();
        broker.declare(&route()).await.unwrap();
        broker.publish("ex", "key", envelope("old")).await.unwrap();

        let mut stream = broker.subscribe("work", "test").await.unwrap();
        broker.publish("ex", "key", envelope("new")).await.unwrap();

        let old = stream.next().await.unwrap().unwrap();
        let new = stream.next().await.unwrap().unwrap();
        assert_eq!(old.envelope.body, b"old");
        assert_eq!(new.envelope.body, b"new");
    }

    #[tokio::test]
    async fn ack_and_reject_settle_exactly_once() {
        let broker = MemoryBroker::new();
        broker.declare(&route()).await.unwrap();
        broker.publish("ex", "key", envelope("a")).await.unwrap();
        broker.publish("ex", "key", envelope("b")).await.unwrap();

        let a = broker.fetch("work").await.unwrap().unwrap();
        let b = broker.fetch("work").await.unwrap().unwrap();

        broker.ack(a.delivery_tag).await.unwrap();
        broker.reject(b.delivery_tag, false).await.unwrap();

        assert!(broker.ack(a.delivery_tag).await.is_err());
        assert_eq!(broker.acked(), vec![a.delivery_tag]);
        assert_eq!(broker.rejected(), vec![(b.delivery_tag, false)]);
        assert_eq!(broker.queue_len("work"), 0);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn fetch_from_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.fetch("missing").await,
            Err(BrokerError::UnknownQueue(_))
        ));
    }
}
