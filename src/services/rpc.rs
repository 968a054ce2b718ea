//! Correlation-based request/reply over the message broker
//!
//! `RpcClient::call` publishes a job on its problem type's work route and
//! returns a [`PendingReply`] future. A single reply listener
//! ([`RpcClient::listen`]) consumes every reply queue and completes the
//! matching pending call by correlation id. Replies with no pending call
//! (late, duplicate or cancelled) are dropped.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerError, Delivery, Envelope, MessageBroker, RouteTable, RouteTableError};
use crate::services::audit::{actions, AuditLogger};
use crate::services::ledger::JobLedger;
use crate::types::{ProblemRequest, ProblemType};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    RouteNotFound(#[from] RouteTableError),
    #[error("transport failure: {0}")]
    Transport(#[from] BrokerError),
    #[error("failed to serialize request: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("call {0} was cancelled")]
    Cancelled(String),
}

struct PendingCall {
    created_at: Instant,
    job_id: i64,
    completion: oneshot::Sender<Vec<u8>>,
}

/// Outstanding calls keyed by correlation id.
///
/// Each entry leaves the table exactly once, through [`PendingCalls::fulfill`]
/// or [`PendingCalls::cancel`].
#[derive(Clone, Default)]
pub struct PendingCalls {
    calls: Arc<Mutex<HashMap<String, PendingCall>>>,
}

impl PendingCalls {
    /// Register a new call under a correlation id unique among pending calls.
    pub fn register(&self, job_id: i64) -> (String, oneshot::Receiver<Vec<u8>>) {
        let (completion, receiver) = oneshot::channel();
        let mut calls = self.calls.lock();
        let correlation_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !calls.contains_key(&candidate) {
                break candidate;
            }
        };
        calls.insert(
            correlation_id.clone(),
            PendingCall {
                created_at: Instant::now(),
                job_id,
                completion,
            },
        );
        (correlation_id, receiver)
    }

    /// Complete and remove the call. Returns its job id, or `None` on a miss.
    pub fn fulfill(&self, correlation_id: &str, body: Vec<u8>) -> Option<i64> {
        let call = self.calls.lock().remove(correlation_id)?;
        debug!(
            "Reply for {} (job {}) after {:?}",
            correlation_id,
            call.job_id,
            call.created_at.elapsed()
        );
        // The caller may have stopped waiting; the entry is gone either way.
        let _ = call.completion.send(body);
        Some(call.job_id)
    }

    /// Remove the call without completing it. Returns `false` if it was already gone.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.calls.lock().remove(correlation_id).is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.calls.lock().contains_key(correlation_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

/// Future resolving to the reply body of one call.
///
/// Dropping it before the reply arrives cancels the call.
pub struct PendingReply {
    correlation_id: String,
    job_id: i64,
    receiver: oneshot::Receiver<Vec<u8>>,
    pending: PendingCalls,
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }
}

impl Future for PendingReply {
    type Output = Result<Vec<u8>, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| RpcError::Cancelled(self.correlation_id.clone())))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.pending.cancel(&self.correlation_id) {
            debug!("Abandoned call {} for job {}", self.correlation_id, self.job_id);
        }
    }
}

pub struct RpcClient {
    broker: Arc<dyn MessageBroker>,
    routes: Arc<RouteTable>,
    pending: PendingCalls,
    ledger: Arc<JobLedger>,
    audit: AuditLogger,
}

impl RpcClient {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        routes: Arc<RouteTable>,
        ledger: Arc<JobLedger>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            broker,
            routes,
            pending: PendingCalls::default(),
            ledger,
            audit,
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Declare every route's exchange, queues and bindings.
    pub async fn declare_routes(&self) -> Result<(), BrokerError> {
        for route in self.routes.entries() {
            self.broker.declare(route).await?;
        }
        Ok(())
    }

    /// Publish `request` on its work route and return the reply future.
    pub async fn call(&self, request: &ProblemRequest) -> Result<PendingReply, RpcError> {
        let route = self.routes.get(request.problem_type)?;
        let body = serde_json::to_vec(request)?;
        let job_id = request.job_id();

        // Registered before publishing so a fast reply always finds its entry.
        let (correlation_id, receiver) = self.pending.register(job_id);
        let reply = PendingReply {
            correlation_id: correlation_id.clone(),
            job_id,
            receiver,
            pending: self.pending.clone(),
        };

        let envelope = Envelope {
            body,
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(route.reply_routing_key.clone()),
            job_id: Some(job_id),
            exchange: Some(route.exchange.clone()),
        };
        // In flight before publishing so a fast reply can complete it.
        let started = self.ledger.start(job_id);
        // On failure `reply` is dropped, which removes the pending entry.
        if let Err(e) = self
            .broker
            .publish(&route.exchange, &route.routing_key, envelope)
            .await
        {
            if started {
                self.ledger.abandon(job_id);
            }
            return Err(e.into());
        }

        info!(
            "Job {} ({}) published as {}",
            job_id, request.problem_type, correlation_id
        );
        self.audit.record(actions::REQUEST_QUEUED, job_id).await;

        Ok(reply)
    }

    /// Stop waiting for `correlation_id`. The published message is not retracted.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let cancelled = self.pending.cancel(correlation_id);
        if cancelled {
            info!("Cancelled call {}", correlation_id);
        }
        cancelled
    }

    /// Consume all reply queues until `shutdown` fires.
    pub async fn listen(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), BrokerError> {
        let mut subscriptions = Vec::with_capacity(self.routes.entries().len());
        for route in self.routes.entries() {
            let consumer_tag = format!("reply-{}", route.problem_type);
            let stream = self.broker.subscribe(&route.reply_queue, &consumer_tag).await?;
            let problem_type = route.problem_type;
            subscriptions.push(stream.map(move |item| (problem_type, item)).boxed());
        }
        let mut replies = stream::select_all(subscriptions);

        info!(
            "Listening for replies on {} queues via {}",
            self.routes.entries().len(),
            self.broker.name()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reply listener stopping");
                    return Ok(());
                }
                next = replies.next() => match next {
                    Some((problem_type, Ok(delivery))) => {
                        self.handle_reply(problem_type, delivery).await
                    }
                    Some((problem_type, Err(e))) => {
                        error!("Reply stream for {} failed: {}", problem_type, e)
                    }
                    None => {
                        warn!("All reply subscriptions ended");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn handle_reply(&self, problem_type: ProblemType, delivery: Delivery) {
        if let Err(e) = self.broker.ack(delivery.delivery_tag).await {
            warn!("Failed to ack {} reply {}: {}", problem_type, delivery.delivery_tag, e);
        }

        let Some(correlation_id) = delivery.envelope.correlation_id.as_deref() else {
            debug!("Dropping {} reply without correlation id", problem_type);
            return;
        };

        match self.pending.fulfill(correlation_id, delivery.envelope.body) {
            Some(job_id) => {
                self.ledger.finish(job_id);
                self.audit.record(actions::REPLY_RETURNED, job_id).await;
            }
            None => debug!("Dropping reply for unknown call {}", correlation_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeliveryStream, MemoryBroker, RouteEntry};
    use crate::services::ledger::LedgerSnapshot;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn request(id: i64, problem_type: ProblemType) -> ProblemRequest {
        ProblemRequest {
            job_data: Map::new(),
            metadata: crate::types::Metadata { id, timestamp: None },
            problem_type,
        }
    }

    async fn client() -> (Arc<MemoryBroker>, Arc<RpcClient>) {
        let broker = Arc::new(MemoryBroker::new());
        let routes = Arc::new(RouteTable::with_defaults("ex"));
        let client = Arc::new(RpcClient::new(
            broker.clone(),
            routes,
            Arc::new(JobLedger::new("test")),
            AuditLogger::disabled(actions::CONTROLLER),
        ));
        client.declare_routes().await.unwrap();
        (broker, client)
    }

    /// Answers each work publish on its reply route before `publish` returns.
    struct EchoingBroker {
        inner: MemoryBroker,
        fail_publish: bool,
    }

    impl EchoingBroker {
        fn new(fail_publish: bool) -> Self {
            Self {
                inner: MemoryBroker::new(),
                fail_publish,
            }
        }
    }

    #[async_trait]
    impl MessageBroker for EchoingBroker {
        async fn declare(&self, route: &RouteEntry) -> Result<(), BrokerError> {
            self.inner.declare(route).await
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            envelope: Envelope,
        ) -> Result<(), BrokerError> {
            if self.fail_publish {
                return Err(BrokerError::Publish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "channel closed".to_string(),
                });
            }
            let reply_to = envelope.reply_to.clone();
            let answer = Envelope {
                body: b"{}".to_vec(),
                correlation_id: envelope.correlation_id.clone(),
                ..Default::default()
            };
            self.inner.publish(exchange, routing_key, envelope).await?;
            if let Some(reply_to) = reply_to {
                self.inner.publish(exchange, &reply_to, answer).await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        }

        async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
            self.inner.fetch(queue).await
        }

        async fn subscribe(
            &self,
            queue: &str,
            consumer_tag: &str,
        ) -> Result<DeliveryStream, BrokerError> {
            self.inner.subscribe(queue, consumer_tag).await
        }

        async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
            self.inner.ack(delivery_tag).await
        }

        async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
            self.inner.reject(delivery_tag, requeue).await
        }

        fn name(&self) -> &str {
            "echoing"
        }
    }

    fn echoing_client(fail_publish: bool) -> (Arc<JobLedger>, Arc<RpcClient>) {
        let ledger = Arc::new(JobLedger::new("test"));
        let client = Arc::new(RpcClient::new(
            Arc::new(EchoingBroker::new(fail_publish)),
            Arc::new(RouteTable::with_defaults("ex")),
            ledger.clone(),
            AuditLogger::disabled(actions::CONTROLLER),
        ));
        (ledger, client)
    }

    #[test]
    fn fulfill_and_cancel_remove_exactly_once() {
        let pending = PendingCalls::default();
        let (first, mut first_rx) = pending.register(1);
        let (second, _second_rx) = pending.register(2);
        assert_ne!(first, second);

        assert_eq!(pending.fulfill(&first, b"done".to_vec()), Some(1));
        assert!(!pending.cancel(&first));
        assert_eq!(pending.fulfill(&first, b"again".to_vec()), None);
        assert_eq!(first_rx.try_recv().unwrap(), b"done");

        assert!(pending.cancel(&second));
        assert_eq!(pending.fulfill(&second, b"late".to_vec()), None);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn out_of_order_replies_do_not_disturb_other_calls() {
        let pending = PendingCalls::default();
        let (first, first_rx) = pending.register(1);
        let (second, second_rx) = pending.register(2);

        pending.fulfill(&second, b"two".to_vec());
        assert!(pending.contains(&first));
        assert_eq!(second_rx.await.unwrap(), b"two");

        pending.fulfill(&first, b"one".to_vec());
        assert_eq!(first_rx.await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn call_publishes_with_correlation_and_reply_route() {
        let (broker, client) = client().await;
        let reply = client.call(&request(7, ProblemType::Vrp)).await.unwrap();

        let published = broker.take_all("VRP_queue");
        assert_eq!(published.len(), 1);
        let envelope = &published[0];
        assert_eq!(envelope.correlation_id.as_deref(), Some(reply.correlation_id()));
        assert_eq!(envelope.reply_to.as_deref(), Some("vrp-key-reply"));
        assert_eq!(envelope.job_id, Some(7));
        assert_eq!(envelope.exchange.as_deref(), Some("ex"));
        assert!(client.pending().contains(reply.correlation_id()));
    }

    #[tokio::test]
    async fn listener_completes_matching_call_and_drops_strays() {
        let (broker, client) = client().await;
        let shutdown = CancellationToken::new();
        let listener = tokio::spawn(client.clone().listen(shutdown.clone()));

        let reply = client.call(&request(3, ProblemType::Knapsack)).await.unwrap();
        let correlation_id = reply.correlation_id().to_string();

        let stray = Envelope {
            body: b"stray".to_vec(),
            correlation_id: Some("nobody".into()),
            ..Default::default()
        };
        broker.publish("ex", "knapsack-key-reply", stray).await.unwrap();

        let answer = Envelope {
            body: json!({"success": true}).to_string().into_bytes(),
            correlation_id: Some(correlation_id.clone()),
            ..Default::default()
        };
        broker.publish("ex", "knapsack-key-reply", answer).await.unwrap();

        let body = tokio::time::timeout(Duration::from_secs(2), reply)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, br#"{"success":true}"#);
        assert!(!client.pending().contains(&correlation_id));
        assert_eq!(broker.acked().len(), 2);

        shutdown.cancel();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancelled_call_ignores_late_reply() {
        let (broker, client) = client().await;
        let shutdown = CancellationToken::new();
        let listener = tokio::spawn(client.clone().listen(shutdown.clone()));

        let reply = client.call(&request(4, ProblemType::CpSat)).await.unwrap();
        let correlation_id = reply.correlation_id().to_string();
        assert!(client.cancel(&correlation_id));
        assert!(!client.cancel(&correlation_id));

        let late = Envelope {
            body: b"late".to_vec(),
            correlation_id: Some(correlation_id),
            ..Default::default()
        };
        broker.publish("ex", "cpsat-key-reply", late).await.unwrap();

        assert!(matches!(reply.await, Err(RpcError::Cancelled(_))));
        shutdown.cancel();
        listener.await.unwrap().unwrap();
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_reply_future_cancels_the_call() {
        let (_broker, client) = client().await;
        let reply = client.call(&request(5, ProblemType::Vrp)).await.unwrap();
        assert_eq!(client.pending().len(), 1);
        drop(reply);
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn reply_arriving_during_publish_completes_the_job() {
        let (ledger, client) = echoing_client(false);
        client.declare_routes().await.unwrap();
        let shutdown = CancellationToken::new();
        let listener = tokio::spawn(client.clone().listen(shutdown.clone()));

        let reply = client.call(&request(77, ProblemType::Vrp)).await.unwrap();
        let body = tokio::time::timeout(Duration::from_secs(2), reply)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"{}");

        let snapshot = ledger.snapshot();
        assert!(snapshot.in_flight.is_empty());
        assert_eq!(snapshot.completed, vec![77]);

        shutdown.cancel();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_publish_leaves_the_ledger_as_it_was() {
        let (ledger, client) = echoing_client(true);
        client.declare_routes().await.unwrap();

        let err = client.call(&request(8, ProblemType::Vrp)).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        assert_eq!(ledger.snapshot(), LedgerSnapshot::default());
        assert!(client.pending().is_empty());

        // An id some other call already holds stays in flight.
        assert!(ledger.start(9));
        assert!(client.call(&request(9, ProblemType::Vrp)).await.is_err());
        assert_eq!(ledger.snapshot().in_flight, vec![9]);
    }

    #[tokio::test]
    async fn unknown_route_is_rejected_before_publishing() {
        let broker = Arc::new(MemoryBroker::new());
        let vrp_only = RouteTable::with_defaults("ex")
            .entries()
            .iter()
            .filter(|r| r.problem_type == ProblemType::Vrp)
            .cloned()
            .collect();
        let client = RpcClient::new(
            broker.clone(),
            Arc::new(RouteTable::new(vrp_only).unwrap()),
            Arc::new(JobLedger::new("test")),
            AuditLogger::disabled(actions::CONTROLLER),
        );

        let err = client.call(&request(1, ProblemType::Knapsack)).await.unwrap_err();
        assert!(matches!(err, RpcError::RouteNotFound(_)));
        assert!(client.pending().is_empty());
    }
}
