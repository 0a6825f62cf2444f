use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::circuit::CircuitBreakerPolicy;
use crate::metrics::{RunnerMetrics, RunnerMetricsSnapshot};
use crate::observe::{Observer, noop_observer};
use crate::policy::{NoOpPolicy, Operation, ResiliencePolicy, operation};
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;

type Pipeline<T> =
    Arc<dyn Fn(Operation<T>, CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Fixed composition of the resilience policies around one operation.
///
/// Outermost to innermost: rate limiter, total timeout, retry, circuit
/// breaker, attempt timeout. Empty slots are [`NoOpPolicy`]. The nesting is
/// built once by [`PolicyRunnerBuilder::build`]; every call runs the same
/// chain.
pub struct PolicyRunner<T> {
    pipeline: Pipeline<T>,
    layers: Arc<[&'static str]>,
    metrics: RunnerMetrics,
    observer: Arc<dyn Observer>,
}

impl<T> Clone for PolicyRunner<T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            layers: Arc::clone(&self.layers),
            metrics: self.metrics.clone(),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<T> std::fmt::Debug for PolicyRunner<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PolicyRunner")
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> PolicyRunner<T> {
    pub fn builder() -> PolicyRunnerBuilder<T> {
        PolicyRunnerBuilder::new()
    }

    /// A runner with every slot empty.
    pub fn passthrough() -> Self {
        Self::compose(Vec::new(), noop_observer())
    }

    fn compose(
        policies: Vec<(&'static str, Arc<dyn ResiliencePolicy<T>>)>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let layers = policies.iter().map(|(name, _)| *name).collect::<Vec<_>>();
        let mut pipeline: Pipeline<T> =
            Arc::new(|operation: Operation<T>, cancel: CancellationToken| operation(cancel));
        for (_, policy) in policies.into_iter().rev() {
            let inner = pipeline;
            pipeline = Arc::new(move |operation: Operation<T>, cancel: CancellationToken| {
                let inner = Arc::clone(&inner);
                let next: Operation<T> = Arc::new(move |cancel: CancellationToken| {
                    inner(Arc::clone(&operation), cancel)
                });
                policy.execute(next, cancel)
            });
        }

        Self {
            pipeline,
            layers: layers.into(),
            metrics: RunnerMetrics::default(),
            observer,
        }
    }

    /// Names of the configured layers, outermost first.
    pub fn layers(&self) -> &[&'static str] {
        &self.layers
    }

    pub async fn execute(&self, operation: Operation<T>, cancel: CancellationToken) -> Result<T> {
        let _in_flight = self.metrics.enter_in_flight();
        let started = Instant::now();
        let result = (self.pipeline)(operation, cancel).await;
        let latency = started.elapsed();
        let error = result.as_ref().err();
        if let Some(error) = error {
            debug!(
                error_code = error.code().as_str(),
                latency_ms = latency.as_millis() as u64,
                "policy pipeline failed"
            );
        }
        self.metrics.record_completed(error, latency);
        self.observer.on_execution_completed(error, latency);
        result
    }

    /// Convenience over [`PolicyRunner::execute`] for an async closure.
    pub async fn run<F, Fut>(&self, work: F, cancel: CancellationToken) -> Result<T>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.execute(operation(work), cancel).await
    }

    pub fn metrics_snapshot(&self) -> RunnerMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl<T: Send + 'static> Default for PolicyRunner<T> {
    fn default() -> Self {
        Self::passthrough()
    }
}

impl<T: Send + 'static> ResiliencePolicy<T> for PolicyRunner<T> {
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>> {
        let runner = self.clone();
        async move { PolicyRunner::execute(&runner, operation, cancel).await }.boxed()
    }
}

/// Collects the optional slots of a [`PolicyRunner`].
///
/// An observer set here is attached to the timeouts and the retry policy.
/// Rate limiters and circuit breakers are shared stateful handles and keep
/// the observer they were built with.
pub struct PolicyRunnerBuilder<T> {
    rate_limiter: Option<Arc<dyn ResiliencePolicy<T>>>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy<T>>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    attempt_timeout: Option<Duration>,
    observer: Option<Arc<dyn Observer>>,
}

impl<T: Send + 'static> PolicyRunnerBuilder<T> {
    pub fn new() -> Self {
        Self {
            rate_limiter: None,
            timeout: None,
            retry: None,
            circuit_breaker: None,
            attempt_timeout: None,
            observer: None,
        }
    }

    /// Admission control slot. Accepts a `RateLimiterPolicy` or a `RateLimiterRouter`.
    pub fn rate_limiter<P>(mut self, rate_limiter: P) -> Self
    where
        P: ResiliencePolicy<T> + 'static,
    {
        self.rate_limiter = Some(Arc::new(rate_limiter));
        self
    }

    /// One deadline shared by the whole retry sequence.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy<T>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Deadline applied to each attempt individually, inside the circuit breaker.
    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = Some(attempt_timeout);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<PolicyRunner<T>> {
        let configured_observer = self.observer;
        let observer = configured_observer.clone().unwrap_or_else(noop_observer);
        let mut policies: Vec<(&'static str, Arc<dyn ResiliencePolicy<T>>)> = Vec::new();

        if let Some(rate_limiter) = self.rate_limiter {
            policies.push(("rate_limiter", rate_limiter));
        }
        if let Some(timeout) = self.timeout {
            let policy = TimeoutPolicy::new(timeout).with_observer(Arc::clone(&observer));
            policy.validate()?;
            policies.push(("timeout", Arc::new(policy)));
        }
        if let Some(retry) = self.retry {
            let retry = match &configured_observer {
                Some(observer) => retry.with_observer(Arc::clone(observer)),
                None => retry,
            };
            policies.push(("retry", Arc::new(retry)));
        }
        if let Some(circuit_breaker) = self.circuit_breaker {
            circuit_breaker.validate()?;
            policies.push(("circuit_breaker", Arc::new(circuit_breaker)));
        }
        if let Some(attempt_timeout) = self.attempt_timeout {
            let policy =
                TimeoutPolicy::per_attempt(attempt_timeout).with_observer(Arc::clone(&observer));
            policy.validate()?;
            policies.push(("attempt_timeout", Arc::new(policy)));
        }

        if policies.is_empty() {
            policies.push(("noop", Arc::new(NoOpPolicy)));
        }
        Ok(PolicyRunner::compose(policies, observer))
    }
}

impl<T: Send + 'static> Default for PolicyRunnerBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::future::{Ready, ready};
    use tokio_util::sync::CancellationToken;

    use super::PolicyRunner;
    use crate::circuit::{CircuitBreakerConfig, CircuitBreakerPolicy};
    use crate::error::{Error, ErrorCode};
    use crate::rate_limit::{RateLimiterPolicy, TokenBucketConfig};
    use crate::retry::{Backoff, RetryPolicy};

    fn failing(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn(CancellationToken) -> Ready<crate::Result<()>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move |_cancel| {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(Err(Error::operation("downstream failure")))
        }
    }

    fn fast_retry(max_attempts: usize) -> RetryPolicy<()> {
        RetryPolicy::standard()
            .max_attempts(max_attempts)
            .backoff(Backoff::Fixed)
            .base_delay(Duration::from_millis(10))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_runner_is_a_pass_through() {
        let runner = PolicyRunner::<u32>::builder()
            .build()
            .expect("empty runner builds");
        assert_eq!(runner.layers(), &["noop"]);
        let value = runner
            .run(|_cancel| async { Ok(5) }, CancellationToken::new())
            .await
            .expect("pass-through returns the value");
        assert_eq!(value, 5);
    }

    #[test]
    fn layers_are_reported_outermost_first() {
        let runner = PolicyRunner::<()>::builder()
            .attempt_timeout(Duration::from_millis(5))
            .circuit_breaker(CircuitBreakerPolicy::standard())
            .retry(fast_retry(2))
            .timeout(Duration::from_secs(1))
            .rate_limiter(
                RateLimiterPolicy::new(TokenBucketConfig::new(1, 1.0)).expect("valid limiter"),
            )
            .build()
            .expect("runner builds");
        assert_eq!(
            runner.layers(),
            &[
                "rate_limiter",
                "timeout",
                "retry",
                "circuit_breaker",
                "attempt_timeout"
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn breaker_inside_retry_trips_during_the_retry_sequence() {
        let runner = PolicyRunner::<()>::builder()
            .retry(fast_retry(5))
            .circuit_breaker(CircuitBreakerPolicy::new(
                CircuitBreakerConfig::standard()
                    .failure_threshold(2)
                    .break_duration(Duration::from_secs(60)),
            ))
            .build()
            .expect("runner builds");
        let calls = Arc::new(AtomicUsize::new(0));

        let error = runner
            .run(failing(&calls), CancellationToken::new())
            .await
            .expect_err("breaker should end the sequence");
        assert_eq!(error.code(), ErrorCode::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_bounds_the_whole_retry_sequence() {
        let runner = PolicyRunner::<()>::builder()
            .timeout(Duration::from_millis(50))
            .retry(fast_retry(100).base_delay(Duration::from_millis(20)))
            .build()
            .expect("runner builds");
        let calls = Arc::new(AtomicUsize::new(0));

        let error = runner
            .run(failing(&calls), CancellationToken::new())
            .await
            .expect_err("shared deadline should fire");
        assert_eq!(error.code(), ErrorCode::DeadlineExceeded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejected_admission_never_reaches_retry_or_operation() {
        let runner = PolicyRunner::<()>::builder()
            .rate_limiter(
                RateLimiterPolicy::new(TokenBucketConfig::new(1, 0.001)).expect("valid limiter"),
            )
            .retry(fast_retry(3).retry_on_errors(|_| true))
            .build()
            .expect("runner builds");
        let calls = Arc::new(AtomicUsize::new(0));

        let _ = runner.run(failing(&calls), CancellationToken::new()).await;
        let error = runner
            .run(failing(&calls), CancellationToken::new())
            .await
            .expect_err("limiter should reject");
        assert_eq!(error.code(), ErrorCode::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "only the admitted call ran");

        let snapshot = runner.metrics_snapshot();
        assert_eq!(snapshot.executions_started, 2);
        assert_eq!(snapshot.executions_failed, 2);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[test]
    fn zero_timeout_fails_the_build() {
        let error = PolicyRunner::<()>::builder()
            .timeout(Duration::ZERO)
            .build()
            .expect_err("zero timeout is invalid");
        assert_eq!(error.code(), ErrorCode::InvalidPolicyConfig);
    }
}
