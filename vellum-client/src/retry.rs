//! Retry policies and the orchestrator that reschedules failed dispatches.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use vellum_core::VellumError;

use crate::request::KeyValueRequest;

/// Why a dispatch attempt did not produce a final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// No live endpoint could accept the dispatch.
    EndpointNotAvailable,
    /// The connection dropped before a response arrived.
    ConnectionLost,
    /// The server answered with a transient failure status.
    TransientFailure,
    /// The server no longer owns the key's partition.
    PartitionMoved,
}

impl RetryReason {
    /// Returns true if a mutation can safely be retried for this reason.
    ///
    /// A lost connection leaves it unknown whether the server applied the
    /// mutation; retrying could apply it twice.
    pub fn allows_non_idempotent(self) -> bool {
        !matches!(self, RetryReason::ConnectionLost)
    }
}

/// Decides whether and when a request is dispatched again.
pub trait RetryPolicy: Send + Sync {
    /// Returns the pause before the next attempt, or `None` to give up.
    fn next_delay(&self, attempts: u32) -> Option<Duration>;
}

/// Backoff settings for [`BestEffortRetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryConfig {
    /// Creates a builder for retry settings.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Returns the delay before the first retry.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the backoff ceiling.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the exponential growth factor.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns the jitter fraction applied to each delay.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    /// Sets the delay before the first retry.
    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = Some(delay);
        self
    }

    /// Sets the backoff ceiling.
    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = Some(delay);
        self
    }

    /// Sets the exponential growth factor.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the jitter fraction (0.0 disables jitter).
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Builds the retry configuration.
    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            initial_backoff: self.initial_backoff.unwrap_or(defaults.initial_backoff),
            max_backoff: self.max_backoff.unwrap_or(defaults.max_backoff),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

/// Retries indefinitely with capped exponential backoff and jitter; the
/// request deadline is the only stopping condition.
#[derive(Debug, Clone, Default)]
pub struct BestEffortRetryPolicy {
    config: RetryConfig,
}

impl BestEffortRetryPolicy {
    /// Creates the policy with explicit backoff settings.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryPolicy for BestEffortRetryPolicy {
    fn next_delay(&self, attempts: u32) -> Option<Duration> {
        let exponent = attempts.saturating_sub(1).min(16) as i32;
        let base =
            self.config.initial_backoff.as_millis() as f64 * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_backoff.as_millis() as f64);
        let scale = if self.config.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.config.jitter..self.config.jitter)
        } else {
            1.0
        };
        Some(Duration::from_millis((capped * scale).max(1.0) as u64))
    }
}

/// Never retries; the first failure is final.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastRetryPolicy;

impl RetryPolicy for FailFastRetryPolicy {
    fn next_delay(&self, _attempts: u32) -> Option<Duration> {
        None
    }
}

/// Central decision point for every failed dispatch.
///
/// The orchestrator either reschedules the request through the dispatch
/// callback after the policy's delay, or completes it with a final error.
/// Requests that already completed are discarded silently, whatever the
/// reason.
pub struct RetryOrchestrator {
    dispatch: Arc<dyn Fn(Arc<KeyValueRequest>) + Send + Sync>,
}

impl RetryOrchestrator {
    /// Creates an orchestrator feeding retries back into a dispatch
    /// function.
    pub fn new(dispatch: Arc<dyn Fn(Arc<KeyValueRequest>) + Send + Sync>) -> Self {
        Self { dispatch }
    }

    /// Decides the fate of a request after a failed attempt.
    pub fn maybe_retry(&self, request: Arc<KeyValueRequest>, reason: RetryReason) {
        if request.is_completed() {
            return;
        }

        if request.operation().is_mutation() && !reason.allows_non_idempotent() {
            tracing::debug!(
                key = %request.key(),
                operation = request.operation().name(),
                ?reason,
                "not retrying a mutation with unknown server-side effect"
            );
            request.cancel(format!(
                "{} for key {} cancelled: the connection dropped mid-flight",
                request.operation().name(),
                request.key()
            ));
            return;
        }

        let attempts = request.attempts();
        let delay = match request.retry_policy().next_delay(attempts) {
            Some(delay) => delay,
            None => {
                request.fail(VellumError::Cancelled(format!(
                    "{} for key {} gave up after {} attempts ({:?})",
                    request.operation().name(),
                    request.key(),
                    attempts,
                    reason
                )));
                return;
            }
        };

        if Instant::now() + delay >= request.deadline() {
            request.fail(VellumError::Timeout(format!(
                "{} for key {} timed out after {} attempts, last reason {:?}",
                request.operation().name(),
                request.key(),
                attempts,
                reason
            )));
            return;
        }

        tracing::debug!(
            key = %request.key(),
            operation = request.operation().name(),
            attempts,
            delay_ms = delay.as_millis() as u64,
            ?reason,
            "rescheduling request"
        );
        let dispatch = self.dispatch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The response may have raced in during the pause.
            if request.is_completed() {
                return;
            }
            dispatch(request);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::request::{KeyValueRequest, Operation, RequestOptions};

    fn orchestrator_with_counter() -> (RetryOrchestrator, Arc<AtomicU32>) {
        let dispatched = Arc::new(AtomicU32::new(0));
        let counter = dispatched.clone();
        let orchestrator = RetryOrchestrator::new(Arc::new(move |_request| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (orchestrator, dispatched)
    }

    #[test]
    fn test_best_effort_backoff_grows_and_caps() {
        let policy = BestEffortRetryPolicy::new(
            RetryConfig::builder()
                .initial_backoff(Duration::from_millis(10))
                .max_backoff(Duration::from_millis(100))
                .multiplier(2.0)
                .jitter(0.0)
                .build(),
        );
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(40)));
        assert_eq!(policy.next_delay(10), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BestEffortRetryPolicy::new(
            RetryConfig::builder()
                .initial_backoff(Duration::from_millis(100))
                .jitter(0.25)
                .build(),
        );
        for _ in 0..100 {
            let delay = policy.next_delay(1).unwrap();
            assert!(delay >= Duration::from_millis(75));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_fail_fast_never_retries() {
        assert!(FailFastRetryPolicy.next_delay(1).is_none());
    }

    #[tokio::test]
    async fn test_completed_request_discarded_silently() {
        let (orchestrator, dispatched) = orchestrator_with_counter();
        let (request, rx) = KeyValueRequest::new(Operation::Get, "k", RequestOptions::new());
        request.cancel("test");

        orchestrator.maybe_retry(request, RetryReason::TransientFailure);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
        // The original completion is untouched.
        assert!(matches!(rx.await.unwrap(), Err(VellumError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_fail_fast_completes_with_error() {
        let (orchestrator, dispatched) = orchestrator_with_counter();
        let (request, rx) = KeyValueRequest::new(
            Operation::Get,
            "k",
            RequestOptions::new().retry_policy(Arc::new(FailFastRetryPolicy)),
        );

        orchestrator.maybe_retry(request, RetryReason::EndpointNotAvailable);
        assert!(matches!(rx.await.unwrap(), Err(VellumError::Cancelled(_))));
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deadline_exhaustion_times_out() {
        let (orchestrator, dispatched) = orchestrator_with_counter();
        let policy = BestEffortRetryPolicy::new(
            RetryConfig::builder()
                .initial_backoff(Duration::from_millis(200))
                .jitter(0.0)
                .build(),
        );
        let (request, rx) = KeyValueRequest::new(
            Operation::Get,
            "k",
            RequestOptions::new()
                .timeout(Duration::from_millis(50))
                .retry_policy(Arc::new(policy)),
        );

        orchestrator.maybe_retry(request, RetryReason::TransientFailure);
        match rx.await.unwrap() {
            Err(VellumError::Timeout(reason)) => {
                assert!(reason.contains("k"));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reschedules_through_dispatch() {
        let (orchestrator, dispatched) = orchestrator_with_counter();
        let policy = BestEffortRetryPolicy::new(
            RetryConfig::builder()
                .initial_backoff(Duration::from_millis(1))
                .jitter(0.0)
                .build(),
        );
        let (request, _rx) = KeyValueRequest::new(
            Operation::Get,
            "k",
            RequestOptions::new()
                .timeout(Duration::from_secs(10))
                .retry_policy(Arc::new(policy)),
        );

        orchestrator.maybe_retry(request, RetryReason::PartitionMoved);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mutation_not_retried_after_connection_loss() {
        let (orchestrator, dispatched) = orchestrator_with_counter();
        let (request, rx) = KeyValueRequest::new(
            Operation::Delete,
            "k",
            RequestOptions::new().timeout(Duration::from_secs(10)),
        );

        orchestrator.maybe_retry(request, RetryReason::ConnectionLost);
        assert!(matches!(rx.await.unwrap(), Err(VellumError::Cancelled(_))));
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lookup_retried_after_connection_loss() {
        let (orchestrator, dispatched) = orchestrator_with_counter();
        let policy = BestEffortRetryPolicy::new(
            RetryConfig::builder()
                .initial_backoff(Duration::from_millis(1))
                .jitter(0.0)
                .build(),
        );
        let (request, _rx) = KeyValueRequest::new(
            Operation::Get,
            "k",
            RequestOptions::new()
                .timeout(Duration::from_secs(10))
                .retry_policy(Arc::new(policy)),
        );

        orchestrator.maybe_retry(request, RetryReason::ConnectionLost);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_racing_the_pause_wins() {
        let (orchestrator, dispatched) = orchestrator_with_counter();
        let policy = BestEffortRetryPolicy::new(
            RetryConfig::builder()
                .initial_backoff(Duration::from_millis(30))
                .jitter(0.0)
                .build(),
        );
        let (request, _rx) = KeyValueRequest::new(
            Operation::Get,
            "k",
            RequestOptions::new()
                .timeout(Duration::from_secs(10))
                .retry_policy(Arc::new(policy)),
        );

        orchestrator.maybe_retry(request.clone(), RetryReason::TransientFailure);
        request.cancel("answered elsewhere");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }
}
