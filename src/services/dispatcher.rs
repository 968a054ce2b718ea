//! Work queue dispatcher
//!
//! For every route: drain the backlog with non-blocking fetches, then
//! subscribe. Each message is forwarded to the solving backend while holding
//! a dispatch permit, the backend's answer (or a failure result) is
//! published on the caller's reply route, and the original message is
//! acked on success or rejected without requeue on failure.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, Delivery, Envelope, MessageBroker, RouteEntry, RouteTable};
use crate::services::audit::{actions, AuditLogger};
use crate::services::backend::{BackendError, SolverBackend};
use crate::services::ledger::JobLedger;
use crate::services::limiter::DispatchLimiter;
use crate::types::{ProblemRequest, ProblemType, ResultObject};

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub job_id: Option<i64>,
    /// Acked (`true`) or rejected without requeue (`false`)
    pub acknowledged: bool,
    pub reply_published: bool,
}

pub struct Dispatcher {
    broker: Arc<dyn MessageBroker>,
    routes: Arc<RouteTable>,
    backend: Arc<dyn SolverBackend>,
    limiter: Arc<DispatchLimiter>,
    ledger: Arc<JobLedger>,
    audit: AuditLogger,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        routes: Arc<RouteTable>,
        backend: Arc<dyn SolverBackend>,
        limiter: Arc<DispatchLimiter>,
        ledger: Arc<JobLedger>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            broker,
            routes,
            backend,
            limiter,
            ledger,
            audit,
        }
    }

    /// Consume every route until `shutdown` fires, then let in-flight jobs finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), BrokerError> {
        for route in self.routes.entries() {
            self.broker.declare(route).await?;
        }
        info!(
            "Dispatching {} routes from {} to solver at {}",
            self.routes.entries().len(),
            self.broker.name(),
            self.backend.name()
        );

        let mut consumers = JoinSet::new();
        for route in self.routes.entries().iter().cloned() {
            let dispatcher = Arc::clone(&self);
            let shutdown = shutdown.clone();
            consumers.spawn(async move { dispatcher.consume(route, shutdown).await });
        }

        let mut first_error = None;
        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Consumer stopped: {}", e);
                    shutdown.cancel();
                    first_error.get_or_insert(e);
                }
                Err(e) => error!("Consumer task panicked: {}", e),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn consume(
        self: Arc<Self>,
        route: RouteEntry,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        let drained = self.drain(&route, &shutdown).await?;
        if drained > 0 {
            info!("Drained {} waiting jobs from {}", drained, route.work_queue);
        }

        let consumer_tag = format!("dispatch-{}", route.problem_type);
        let mut deliveries = self.broker.subscribe(&route.work_queue, &consumer_tag).await?;
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    settled(route.problem_type, joined);
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let dispatcher = Arc::clone(&self);
                        let problem_type = route.problem_type;
                        in_flight.spawn(async move {
                            dispatcher.process(problem_type, delivery).await
                        });
                    }
                    Some(Err(e)) => error!("Error receiving from {}: {}", route.work_queue, e),
                    None => {
                        warn!("Subscription to {} ended", route.work_queue);
                        break;
                    }
                },
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            settled(route.problem_type, joined);
        }
        Ok(())
    }

    /// Process whatever is already waiting in the work queue, one at a time.
    async fn drain(
        &self,
        route: &RouteEntry,
        shutdown: &CancellationToken,
    ) -> Result<usize, BrokerError> {
        let mut drained = 0;
        while !shutdown.is_cancelled() {
            let Some(delivery) = self.broker.fetch(&route.work_queue).await? else {
                break;
            };
            let outcome = self.process(route.problem_type, delivery).await;
            settled(route.problem_type, Ok(outcome));
            drained += 1;
        }
        Ok(drained)
    }

    /// Forward one job, publish its reply and settle the delivery.
    pub async fn process(&self, problem_type: ProblemType, delivery: Delivery) -> DispatchOutcome {
        let Delivery { delivery_tag, envelope } = delivery;

        let parsed = serde_json::from_slice::<ProblemRequest>(&envelope.body);
        let job_id = envelope
            .job_id
            .or_else(|| parsed.as_ref().ok().map(ProblemRequest::job_id));
        // A duplicate of a job already in flight leaves its ledger entry alone.
        let started = job_id.is_some_and(|id| self.ledger.start(id));

        let mut permit: Option<OwnedSemaphorePermit> = None;
        let outcome = match parsed {
            Err(e) => Err(ResultObject::failure(format!("Malformed job document: {e}"))),
            Ok(_) => match self.limiter.acquire(problem_type).await {
                Err(_) => Err(ResultObject::failure("Dispatcher is shutting down")),
                Ok(acquired) => {
                    permit = Some(acquired);
                    if let Some(job_id) = job_id {
                        self.audit.record(actions::DISPATCH_STARTED, job_id).await;
                    }
                    debug!("Forwarding {} job {:?} to solver", problem_type, job_id);
                    self.backend.solve(&envelope.body).await.map_err(failure_result)
                }
            },
        };

        let (succeeded, reply_body) = match outcome {
            Ok(body) => (true, body),
            Err(result) => {
                warn!("{} job {:?} failed: {}", problem_type, job_id, result.info);
                (false, result.to_json_bytes())
            }
        };

        let reply_published = self
            .publish_reply(problem_type, &envelope, job_id, reply_body)
            .await;
        let acknowledged = succeeded && reply_published;
        let settled = if acknowledged {
            self.broker.ack(delivery_tag).await
        } else {
            self.broker.reject(delivery_tag, false).await
        };
        if let Err(e) = settled {
            error!("Failed to settle {} delivery {}: {}", problem_type, delivery_tag, e);
        }

        if let Some(job_id) = job_id {
            self.audit.record(actions::DISPATCH_FINISHED, job_id).await;
            if started {
                self.ledger.finish(job_id);
            }
        }
        drop(permit);

        DispatchOutcome {
            job_id,
            acknowledged,
            reply_published,
        }
    }

    async fn publish_reply(
        &self,
        problem_type: ProblemType,
        request: &Envelope,
        job_id: Option<i64>,
        body: Vec<u8>,
    ) -> bool {
        let Some(routing_key) = request.reply_to.as_deref() else {
            warn!("{} job {:?} has no reply route, reply dropped", problem_type, job_id);
            return false;
        };
        let exchange = match (&request.exchange, self.routes.get(problem_type)) {
            (Some(exchange), _) => exchange.clone(),
            (None, Ok(route)) => route.exchange.clone(),
            (None, Err(e)) => {
                error!("Cannot reply to {} job {:?}: {}", problem_type, job_id, e);
                return false;
            }
        };

        let reply = Envelope {
            body,
            correlation_id: request.correlation_id.clone(),
            reply_to: None,
            job_id,
            exchange: None,
        };
        match self.broker.publish(&exchange, routing_key, reply).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to publish reply for {} job {:?}: {}", problem_type, job_id, e);
                false
            }
        }
    }
}

fn settled(problem_type: ProblemType, joined: Result<DispatchOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => debug!(
            "{} job {:?} settled: acked {}, reply published {}",
            problem_type, outcome.job_id, outcome.acknowledged, outcome.reply_published
        ),
        Err(e) => error!("Dispatch task for {} panicked: {}", problem_type, e),
    }
}

/// A busy solver answers with its own result object; keep it for the caller.
fn failure_result(error: BackendError) -> ResultObject {
    if let BackendError::Status { body, .. } = &error {
        if let Ok(result) = serde_json::from_str::<ResultObject>(body) {
            if !result.info.is_empty() {
                return result;
            }
        }
    }
    ResultObject::failure(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::types::SERVICE_UNAVAILABLE;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Backend double answering from a script, recording every call.
    #[derive(Default)]
    struct ScriptedBackend {
        script: Mutex<Vec<Result<Vec<u8>, BackendError>>>,
        calls: Mutex<Vec<i64>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedBackend {
        fn answering(script: Vec<Result<Vec<u8>, BackendError>>) -> Self {
            Self {
                script: Mutex::new(script),
                ..Default::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<i64> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl SolverBackend for ScriptedBackend {
        async fn solve(&self, payload: &[u8]) -> Result<Vec<u8>, BackendError> {
            let request: ProblemRequest = serde_json::from_slice(payload).unwrap();
            self.calls.lock().push(request.job_id());

            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(ResultObject::solved(1, None).to_json_bytes())
            } else {
                script.remove(0)
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct Harness {
        broker: Arc<MemoryBroker>,
        backend: Arc<ScriptedBackend>,
        limiter: Arc<DispatchLimiter>,
        ledger: Arc<JobLedger>,
        dispatcher: Arc<Dispatcher>,
    }

    async fn harness(backend: ScriptedBackend) -> Harness {
        let broker = Arc::new(MemoryBroker::new());
        let routes = Arc::new(RouteTable::with_defaults("ex"));
        for route in routes.entries() {
            broker.declare(route).await.unwrap();
        }
        let backend = Arc::new(backend);
        let limiter = Arc::new(DispatchLimiter::single_flight());
        let ledger = Arc::new(JobLedger::new("test"));
        let dispatcher = Arc::new(Dispatcher::new(
            broker.clone(),
            routes,
            backend.clone(),
            limiter.clone(),
            ledger.clone(),
            AuditLogger::disabled(actions::DISPATCHER),
        ));
        Harness {
            broker,
            backend,
            limiter,
            ledger,
            dispatcher,
        }
    }

    fn job(id: i64, problem_type: ProblemType) -> Envelope {
        let (key, body) = match problem_type {
            ProblemType::Vrp => ("vrp-key-reply", "VRP"),
            ProblemType::Knapsack => ("knapsack-key-reply", "Knapsack"),
            ProblemType::CpSat => ("cpsat-key-reply", "CpSat"),
        };
        Envelope {
            body: json!({"jobData": {}, "metadata": {"id": id}, "problemType": body})
                .to_string()
                .into_bytes(),
            correlation_id: Some(format!("corr-{id}")),
            reply_to: Some(key.to_string()),
            job_id: Some(id),
            exchange: Some("ex".to_string()),
        }
    }

    async fn enqueue(broker: &MemoryBroker, problem_type: ProblemType, envelope: Envelope) {
        let key = match problem_type {
            ProblemType::Vrp => "vrp-key",
            ProblemType::Knapsack => "knapsack-key",
            ProblemType::CpSat => "cpsat-key",
        };
        broker.publish("ex", key, envelope).await.unwrap();
    }

    fn reply_result(envelope: &Envelope) -> ResultObject {
        serde_json::from_slice(&envelope.body).unwrap()
    }

    #[tokio::test]
    async fn successful_job_is_replied_and_acked() {
        let h = harness(ScriptedBackend::default()).await;
        enqueue(&h.broker, ProblemType::Vrp, job(1, ProblemType::Vrp)).await;
        let delivery = h.broker.fetch("VRP_queue").await.unwrap().unwrap();
        let tag = delivery.delivery_tag;

        let outcome = h.dispatcher.process(ProblemType::Vrp, delivery).await;

        assert_eq!(
            outcome,
            DispatchOutcome {
                job_id: Some(1),
                acknowledged: true,
                reply_published: true
            }
        );
        assert_eq!(h.broker.acked(), vec![tag]);
        let replies = h.broker.take_all("VRP_client_queue");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].correlation_id.as_deref(), Some("corr-1"));
        assert!(reply_result(&replies[0]).success);
        assert_eq!(h.ledger.snapshot().completed, vec![1]);
        assert_eq!(h.limiter.available(ProblemType::Vrp), 1);
    }

    #[tokio::test]
    async fn backend_failure_replies_with_failure_and_rejects_without_requeue() {
        let h = harness(ScriptedBackend::answering(vec![Err(BackendError::Timeout(
            Duration::from_secs(300),
        ))]))
        .await;
        enqueue(&h.broker, ProblemType::Knapsack, job(2, ProblemType::Knapsack)).await;
        let delivery = h.broker.fetch("Knapsack_queue").await.unwrap().unwrap();
        let tag = delivery.delivery_tag;

        let outcome = h.dispatcher.process(ProblemType::Knapsack, delivery).await;

        assert!(!outcome.acknowledged);
        assert!(outcome.reply_published);
        assert_eq!(h.broker.rejected(), vec![(tag, false)]);
        assert_eq!(h.broker.queue_len("Knapsack_queue"), 0);

        let replies = h.broker.take_all("Knapsack_client_queue");
        let result = reply_result(&replies[0]);
        assert!(!result.success);
        assert!(result.info.contains("did not respond"));
        assert_eq!(h.ledger.snapshot().completed, vec![2]);
    }

    #[tokio::test]
    async fn busy_solver_result_is_forwarded_to_caller() {
        let busy = ResultObject::busy(None).to_json_bytes();
        let h = harness(ScriptedBackend::answering(vec![Err(BackendError::Status {
            status: 503,
            body: String::from_utf8(busy).unwrap(),
        })]))
        .await;
        enqueue(&h.broker, ProblemType::Vrp, job(3, ProblemType::Vrp)).await;
        let delivery = h.broker.fetch("VRP_queue").await.unwrap().unwrap();

        let outcome = h.dispatcher.process(ProblemType::Vrp, delivery).await;

        assert!(!outcome.acknowledged);
        let replies = h.broker.take_all("VRP_client_queue");
        assert_eq!(reply_result(&replies[0]).info, SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_without_calling_backend() {
        let h = harness(ScriptedBackend::default()).await;
        let mut envelope = job(4, ProblemType::Vrp);
        envelope.body = b"not json".to_vec();
        enqueue(&h.broker, ProblemType::Vrp, envelope).await;
        let delivery = h.broker.fetch("VRP_queue").await.unwrap().unwrap();

        let outcome = h.dispatcher.process(ProblemType::Vrp, delivery).await;

        assert!(!outcome.acknowledged);
        assert!(h.backend.calls().is_empty());
        let replies = h.broker.take_all("VRP_client_queue");
        assert!(reply_result(&replies[0]).info.starts_with("Malformed job document"));
        assert_eq!(h.ledger.snapshot().completed, vec![4]);
    }

    #[tokio::test]
    async fn redelivered_job_leaves_the_running_copy_in_flight() {
        let h = harness(ScriptedBackend::default()).await;
        assert!(h.ledger.start(6));
        enqueue(&h.broker, ProblemType::Vrp, job(6, ProblemType::Vrp)).await;
        let delivery = h.broker.fetch("VRP_queue").await.unwrap().unwrap();

        let outcome = h.dispatcher.process(ProblemType::Vrp, delivery).await;

        assert!(outcome.acknowledged);
        assert_eq!(h.backend.calls(), vec![6]);
        let snapshot = h.ledger.snapshot();
        assert_eq!(snapshot.in_flight, vec![6]);
        assert!(snapshot.completed.is_empty());
    }

    #[tokio::test]
    async fn backlog_waits_for_held_permit_across_queues() {
        let h = harness(ScriptedBackend::default()).await;
        // Job A holds the only permit.
        let job_a = h.limiter.acquire(ProblemType::Vrp).await.unwrap();
        enqueue(&h.broker, ProblemType::Knapsack, job(20, ProblemType::Knapsack)).await;

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(h.dispatcher.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.backend.calls().is_empty());
        assert_eq!(h.ledger.snapshot().in_flight, vec![20]);

        drop(job_a);
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.ledger.snapshot().completed != vec![20] {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.backend.calls(), vec![20]);

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn jobs_from_all_queues_run_one_at_a_time() {
        let h = harness(ScriptedBackend::slow(Duration::from_millis(20))).await;
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(h.dispatcher.clone().run(shutdown.clone()));

        for (id, problem_type) in [
            (1, ProblemType::Vrp),
            (2, ProblemType::Knapsack),
            (3, ProblemType::CpSat),
            (4, ProblemType::Vrp),
        ] {
            enqueue(&h.broker, problem_type, job(id, problem_type)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.ledger.snapshot().completed.len() < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.backend.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(h.broker.acked().len(), 4);

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }
}
