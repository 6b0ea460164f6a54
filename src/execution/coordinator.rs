//! Races attempts for one logical read across the candidate replicas.

use super::attempt::{classify, AttemptError, AttemptReport};
use crate::config::{ClientConfig, HedgingPolicy, RetryPolicy};
use crate::error::{Error, Result, TransportError};
use crate::metrics::{AttemptTrigger, ClientMetrics};
use crate::network::{ReplicaRequest, Transport};
use crate::routing::ReplicaSelector;
use crate::types::{InstanceEndpoint, PartitionId, VersionedValue};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const MIN_RETRY_POLL: Duration = Duration::from_millis(1);

/// Lifecycle of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Racing,
    Succeeded,
    Failed,
}

/// A routed single-key read.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub resource: String,
    pub partition: PartitionId,
    pub key: Bytes,
    /// Ready replicas of the partition, in metadata order.
    pub replicas: Vec<InstanceEndpoint>,
}

/// Issues attempts according to the hedging and retry policies.
///
/// At most the policy's bound of attempts is outstanding at any time. The
/// first successful attempt wins and every other attempt is aborted; the
/// attempts live in a [`JoinSet`], so dropping the request future aborts them
/// as well.
pub struct ExecutionCoordinator {
    transport: Arc<dyn Transport>,
    selector: Arc<ReplicaSelector>,
    metrics: Arc<ClientMetrics>,
    hedging: HedgingPolicy,
    retry: RetryPolicy,
    request_timeout: Duration,
    next_request_id: AtomicU64,
}

impl ExecutionCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        selector: Arc<ReplicaSelector>,
        metrics: Arc<ClientMetrics>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            transport,
            selector,
            metrics,
            hedging: config.hedging,
            retry: config.retry,
            request_timeout: config.request_timeout,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn selector(&self) -> &Arc<ReplicaSelector> {
        &self.selector
    }

    /// Execute with the configured request timeout.
    pub async fn execute(
        &self,
        request: ReadRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<VersionedValue>> {
        let deadline = Instant::now() + self.request_timeout;
        self.execute_until(request, deadline, cancel).await
    }

    /// Execute until `deadline`.
    pub async fn execute_until(
        &self,
        request: ReadRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<VersionedValue>> {
        let candidates = self.selector.select(&request.replicas);
        if candidates.is_empty() {
            return Err(Error::NoAvailableReplica {
                resource: request.resource,
                partition: request.partition,
            });
        }

        let mut race = Race::new(self, &request, candidates, deadline);
        race.run(cancel).await
    }
}

/// Book-keeping of one logical request while attempts are racing.
struct Race<'a> {
    coordinator: &'a ExecutionCoordinator,
    request: &'a ReadRequest,
    candidates: Vec<InstanceEndpoint>,
    started: Instant,
    deadline: Instant,
    state: RequestState,

    attempts: JoinSet<AttemptReport>,
    launched: usize,
    max_attempts: usize,
    max_in_flight: usize,

    hedge_at: Option<Instant>,
    retry_at: Option<Instant>,
    owed_retries: usize,

    failures: usize,
    not_serving: usize,
    last_transport_error: Option<TransportError>,
}

impl<'a> Race<'a> {
    fn new(
        coordinator: &'a ExecutionCoordinator,
        request: &'a ReadRequest,
        candidates: Vec<InstanceEndpoint>,
        deadline: Instant,
    ) -> Self {
        let max_attempts = coordinator
            .retry
            .max_attempts
            .max(coordinator.hedging.initial_attempts())
            .max(1);
        Self {
            coordinator,
            request,
            candidates,
            started: Instant::now(),
            deadline,
            state: RequestState::Pending,
            attempts: JoinSet::new(),
            launched: 0,
            max_attempts,
            max_in_flight: coordinator.hedging.max_in_flight().min(max_attempts),
            hedge_at: None,
            retry_at: None,
            owed_retries: 0,
            failures: 0,
            not_serving: 0,
            last_transport_error: None,
        }
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<Option<VersionedValue>> {
        self.transition(RequestState::Racing);

        let initial = self
            .coordinator
            .hedging
            .initial_attempts()
            .min(self.candidates.len())
            .min(self.max_in_flight);
        for _ in 0..initial {
            self.launch(AttemptTrigger::Initial);
        }

        loop {
            let deadline = self.deadline;
            let wakeup = self.next_wakeup();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Err(self.fail(Error::Cancelled));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let elapsed = self.started.elapsed();
                    return Err(self.fail(Error::Timeout { elapsed }));
                }
                Some(joined) = self.attempts.join_next() => {
                    let report = match joined {
                        Ok(report) => report,
                        Err(e) => {
                            // A panicked attempt counts as a transport failure
                            // of an unknown replica.
                            debug!(error = %e, "Attempt task failed");
                            self.failures += 1;
                            self.last_transport_error =
                                Some(TransportError::ReceiveFailed(e.to_string()));
                            continue;
                        }
                    };
                    if let Some(result) = self.on_report(report) {
                        return result;
                    }
                }
                _ = tokio::time::sleep_until(wakeup.unwrap_or(deadline)), if wakeup.is_some() => {
                    self.on_timer();
                }
            }

            if self.exhausted() {
                let error = self.exhausted_error();
                return Err(self.fail(error));
            }
        }
    }

    fn transition(&mut self, next: RequestState) {
        debug!(
            resource = %self.request.resource,
            partition = self.request.partition,
            from = ?self.state,
            to = ?next,
            attempts = self.launched,
            "Request state changed"
        );
        self.state = next;
    }

    fn can_launch(&self) -> bool {
        self.launched < self.max_attempts && self.attempts.len() < self.max_in_flight
    }

    fn launch(&mut self, trigger: AttemptTrigger) {
        let seq = self.launched;
        let endpoint = self.candidates[seq % self.candidates.len()].clone();
        self.launched += 1;

        let coordinator = self.coordinator;
        coordinator.metrics.record_attempt(trigger);
        let wire = ReplicaRequest::new(
            coordinator.next_request_id.fetch_add(1, Ordering::Relaxed),
            self.request.resource.clone(),
            self.request.partition,
            self.request.key.clone(),
        );
        let transport = coordinator.transport.clone();
        let guard = coordinator.selector.track(&endpoint);
        let deadline = self.deadline;

        trace!(
            resource = %self.request.resource,
            partition = self.request.partition,
            endpoint = %endpoint,
            seq,
            trigger = ?trigger,
            "Launching attempt"
        );

        self.attempts.spawn(async move {
            let _guard = guard;
            let response = match tokio::time::timeout_at(deadline, transport.get(&endpoint, wire)).await {
                Ok(response) => response,
                Err(_) => Err(TransportError::Timeout),
            };
            AttemptReport {
                seq,
                endpoint,
                result: classify(response),
            }
        });

        self.hedge_at = match self.coordinator.hedging.hedge_delay() {
            Some(delay) if self.launched < self.candidates.len() && self.launched < self.max_attempts => {
                Some(Instant::now() + delay)
            }
            _ => None,
        };
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let retry = if self.owed_retries > 0 { self.retry_at } else { None };
        match (self.hedge_at, retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();

        if self.hedge_at.is_some_and(|at| at <= now) {
            self.hedge_at = None;
            if self.can_launch() && self.launched < self.candidates.len() {
                self.launch(AttemptTrigger::Hedge);
            }
        }

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            while self.owed_retries > 0 && self.can_launch() {
                self.owed_retries -= 1;
                self.launch(AttemptTrigger::Retry);
            }
            if self.launched >= self.max_attempts {
                self.owed_retries = 0;
            }
            if self.owed_retries > 0 {
                // Still capped by in-flight attempts; look again shortly.
                self.retry_at = Some(now + self.coordinator.retry.backoff.max(MIN_RETRY_POLL));
            }
        }
    }

    /// Returns the final result if this report ends the request.
    fn on_report(&mut self, report: AttemptReport) -> Option<Result<Option<VersionedValue>>> {
        match report.result {
            Ok(value) => Some(Ok(self.succeed(report.seq, report.endpoint, value))),
            Err(e) if e.is_retryable() => {
                self.on_retryable_failure(report.endpoint, e);
                None
            }
            Err(e) => {
                self.coordinator.metrics.record_attempt_failure(e.reason());
                debug!(
                    resource = %self.request.resource,
                    endpoint = %report.endpoint,
                    error = %e,
                    "Attempt failed terminally"
                );
                Some(Err(self.fail(e.into())))
            }
        }
    }

    fn on_retryable_failure(&mut self, endpoint: InstanceEndpoint, error: AttemptError) {
        let coordinator = self.coordinator;
        self.failures += 1;
        coordinator.metrics.record_attempt_failure(error.reason());
        coordinator.selector.mark_unhealthy(&endpoint);
        debug!(
            resource = %self.request.resource,
            partition = self.request.partition,
            endpoint = %endpoint,
            error = %error,
            "Attempt failed, trying next candidate"
        );

        match error {
            AttemptError::NotServing => self.not_serving += 1,
            AttemptError::Transport(e) => self.last_transport_error = Some(e),
            _ => {}
        }

        if self.launched >= self.max_attempts {
            return;
        }
        if self.launched < self.candidates.len() && self.can_launch() {
            self.launch(AttemptTrigger::Retry);
        } else {
            // Every candidate has been tried once: revisit after a pause.
            self.owed_retries += 1;
            if self.retry_at.is_none() {
                self.retry_at = Some(Instant::now() + coordinator.retry.backoff);
            }
        }
    }

    /// Pick the winner among the finished attempts and stop the rest.
    fn succeed(
        &mut self,
        seq: usize,
        endpoint: InstanceEndpoint,
        value: Option<VersionedValue>,
    ) -> Option<VersionedValue> {
        let (mut best_seq, mut best_endpoint, mut best_value) = (seq, endpoint, value);

        // Attempts that already finished compete on candidate order.
        while let Some(joined) = self.attempts.try_join_next() {
            if let Ok(report) = joined {
                match report.result {
                    Ok(value) if report.seq < best_seq => {
                        best_seq = report.seq;
                        best_endpoint = report.endpoint;
                        best_value = value;
                    }
                    Err(e) if e.is_retryable() => {
                        self.coordinator.selector.mark_unhealthy(&report.endpoint);
                    }
                    _ => {}
                }
            }
        }

        self.coordinator.selector.mark_healthy(&best_endpoint);
        self.transition(RequestState::Succeeded);
        self.abort_outstanding();
        trace!(
            resource = %self.request.resource,
            endpoint = %best_endpoint,
            seq = best_seq,
            elapsed = ?self.started.elapsed(),
            "Attempt won"
        );
        best_value
    }

    fn fail(&mut self, error: Error) -> Error {
        self.transition(RequestState::Failed);
        self.abort_outstanding();
        error
    }

    fn abort_outstanding(&mut self) {
        let outstanding = self.attempts.len();
        if outstanding > 0 {
            self.coordinator.metrics.record_cancelled_attempts(outstanding);
            self.attempts.abort_all();
        }
    }

    fn exhausted(&self) -> bool {
        self.attempts.is_empty() && (self.owed_retries == 0 || self.launched >= self.max_attempts)
    }

    fn exhausted_error(&mut self) -> Error {
        if self.failures > 0 && self.not_serving == self.failures {
            return Error::StaleMetadata {
                resource: self.request.resource.clone(),
            };
        }
        match self.last_transport_error.take() {
            Some(e) => Error::RetryableTransport(e),
            None => Error::Internal("attempts exhausted without a recorded failure".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;
    use crate::testing::{MockTransport, ReplicaBehavior};

    const RESOURCE: &str = "users_v1";

    fn endpoint(port: u16) -> InstanceEndpoint {
        InstanceEndpoint::new("127.0.0.1", port)
    }

    fn request(key: &str, replicas: Vec<InstanceEndpoint>) -> ReadRequest {
        ReadRequest {
            resource: RESOURCE.to_string(),
            partition: 0,
            key: Bytes::from(key.to_string()),
            replicas,
        }
    }

    fn coordinator(transport: Arc<MockTransport>, config: ClientConfig) -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            transport,
            Arc::new(ReplicaSelector::new(SelectorConfig::default())),
            Arc::new(ClientMetrics::new()),
            &config,
        )
    }

    fn transport_with_key() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport.put(RESOURCE, "key_1", 1, "value_1");
        transport
    }

    async fn wait_cancelled(transport: &MockTransport, expected: usize) -> bool {
        for _ in 0..100 {
            if transport.cancelled() >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedge_wins_and_cancels_slow_attempt() {
        let transport = transport_with_key();
        let slow = endpoint(7001);
        let fast = endpoint(7002);
        transport.set_behavior(&slow, ReplicaBehavior::Hang);

        let config = ClientConfig::new("users").with_hedging(HedgingPolicy::SequentialWithFallback {
            hedge_delay: Duration::from_millis(10),
            max_in_flight: 2,
        });
        let coordinator = coordinator(transport.clone(), config);
        // Demote the fast replica so the hanging one is tried first.
        coordinator.selector().mark_unhealthy(&fast);

        let value = coordinator
            .execute(request("key_1", vec![slow.clone(), fast.clone()]), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(value.value, Bytes::from_static(b"value_1"));
        assert_eq!(transport.calls(&slow), 1);
        assert_eq!(transport.calls(&fast), 1);
        assert!(wait_cancelled(&transport, 1).await);
        assert_eq!(coordinator.metrics.snapshot().hedged_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_first_success_wins() {
        let transport = transport_with_key();
        let replicas = vec![endpoint(7001), endpoint(7002), endpoint(7003)];
        transport.set_behavior(&replicas[0], ReplicaBehavior::Hang);
        transport.set_behavior(&replicas[1], ReplicaBehavior::Delay(Duration::from_millis(5)));
        transport.set_behavior(&replicas[2], ReplicaBehavior::Hang);

        let config = ClientConfig::new("users").with_hedging(HedgingPolicy::Parallel { fan_out: 3 });
        let coordinator = coordinator(transport.clone(), config);

        let value = coordinator
            .execute(request("key_1", replicas.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(value.is_some());
        assert_eq!(transport.total_calls(), 3);
        assert!(wait_cancelled(&transport, 2).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_fan_out_exceeds_retry_budget() {
        let transport = transport_with_key();
        let replicas: Vec<_> = (0..4).map(|i| endpoint(7001 + i)).collect();
        for ep in &replicas[..3] {
            transport.set_behavior(ep, ReplicaBehavior::Hang);
        }

        // Default retry budget is 3, below the fan-out.
        let config = ClientConfig::new("users")
            .with_request_timeout(Duration::from_millis(100))
            .with_hedging(HedgingPolicy::Parallel { fan_out: 4 });
        let coordinator = coordinator(transport.clone(), config);
        // Only the last replica in selection order can answer.
        coordinator.selector().mark_unhealthy(&replicas[3]);

        let value = coordinator
            .execute(request("key_1", replicas.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(value.is_some());
        assert_eq!(transport.total_calls(), 4);
        assert_eq!(transport.calls(&replicas[3]), 1);
        assert!(wait_cancelled(&transport, 3).await);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let transport = transport_with_key();
        let replicas = vec![endpoint(7001), endpoint(7002)];
        let config = ClientConfig::new("users").with_hedging(HedgingPolicy::None);
        let coordinator = coordinator(transport.clone(), config);

        let value = coordinator
            .execute(request("missing", replicas), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(transport.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_terminal() {
        let transport = transport_with_key();
        let replicas = vec![endpoint(7001), endpoint(7002)];
        for ep in &replicas {
            transport.set_behavior(ep, ReplicaBehavior::SchemaMismatch("int vs string".into()));
        }
        let config = ClientConfig::new("users").with_hedging(HedgingPolicy::None);
        let coordinator = coordinator(transport.clone(), config);

        let result = coordinator
            .execute(request("key_1", replicas), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::SchemaMismatch(_))));
        assert_eq!(transport.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_response_is_terminal() {
        let transport = transport_with_key();
        let replicas = vec![endpoint(7001)];
        transport.set_behavior(&replicas[0], ReplicaBehavior::Corrupt);
        let coordinator = coordinator(transport.clone(), ClientConfig::new("users"));

        let result = coordinator
            .execute(request("key_1", replicas), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Deserialization(_))));
    }

    #[tokio::test]
    async fn test_failover_to_healthy_replica() {
        let transport = transport_with_key();
        let down = endpoint(7001);
        let up = endpoint(7002);
        transport.set_behavior(&down, ReplicaBehavior::Refuse);

        let config = ClientConfig::new("users").with_hedging(HedgingPolicy::None);
        let coordinator = coordinator(transport.clone(), config);
        coordinator.selector().mark_unhealthy(&up);

        let value = coordinator
            .execute(request("key_1", vec![down.clone(), up.clone()]), &CancellationToken::new())
            .await
            .unwrap();
        assert!(value.is_some());
        assert!(coordinator.selector().is_blocked(&down));
        assert!(!coordinator.selector().is_blocked(&up));
        assert_eq!(coordinator.metrics.snapshot().retried_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_not_serving_is_stale_metadata() {
        let transport = Arc::new(MockTransport::new());
        let replicas = vec![endpoint(7001), endpoint(7002)];
        let coordinator = coordinator(transport.clone(), ClientConfig::new("users"));

        let result = coordinator
            .execute(request("key_1", replicas), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::StaleMetadata { ref resource }) if resource == RESOURCE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_revisit_candidates_up_to_budget() {
        let transport = transport_with_key();
        let replicas = vec![endpoint(7001), endpoint(7002)];
        for ep in &replicas {
            transport.set_behavior(ep, ReplicaBehavior::Refuse);
        }
        let config = ClientConfig::new("users")
            .with_hedging(HedgingPolicy::None)
            .with_retry(RetryPolicy::new(5).with_backoff(Duration::from_millis(2)));
        let coordinator = coordinator(transport.clone(), config);

        let result = coordinator
            .execute(request("key_1", replicas), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(Error::RetryableTransport(TransportError::ConnectionFailed { .. }))
        ));
        assert_eq!(transport.total_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_request() {
        let transport = transport_with_key();
        let replicas = vec![endpoint(7001), endpoint(7002)];
        for ep in &replicas {
            transport.set_behavior(ep, ReplicaBehavior::Hang);
        }
        let config = ClientConfig::new("users").with_request_timeout(Duration::from_millis(50));
        let coordinator = coordinator(transport.clone(), config);

        let started = Instant::now();
        let result = coordinator
            .execute(request("key_1", replicas), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(60));
        assert!(wait_cancelled(&transport, 2).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_bound() {
        let transport = transport_with_key();
        let replicas: Vec<_> = (0..4).map(|i| endpoint(7001 + i)).collect();
        for ep in &replicas {
            transport.set_behavior(ep, ReplicaBehavior::Hang);
        }
        let config = ClientConfig::new("users")
            .with_request_timeout(Duration::from_millis(100))
            .with_retry(RetryPolicy::new(10))
            .with_hedging(HedgingPolicy::SequentialWithFallback {
                hedge_delay: Duration::from_millis(5),
                max_in_flight: 2,
            });
        let coordinator = coordinator(transport.clone(), config);

        let _ = coordinator
            .execute(request("key_1", replicas), &CancellationToken::new())
            .await;
        assert_eq!(transport.max_concurrent(), 2);
        assert_eq!(transport.total_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_attempts() {
        let transport = transport_with_key();
        let replicas = vec![endpoint(7001)];
        transport.set_behavior(&replicas[0], ReplicaBehavior::Hang);
        let coordinator = coordinator(transport.clone(), ClientConfig::new("users"));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = coordinator.execute(request("key_1", replicas), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(wait_cancelled(&transport, 1).await);
    }

    #[tokio::test]
    async fn test_no_replicas() {
        let transport = transport_with_key();
        let coordinator = coordinator(transport.clone(), ClientConfig::new("users"));

        let result = coordinator
            .execute(request("key_1", Vec::new()), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(Error::NoAvailableReplica { partition: 0, .. })
        ));
        assert_eq!(transport.total_calls(), 0);
    }
}
