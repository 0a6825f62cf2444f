use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{Response, StatusCode};
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::error::{Error, ErrorKind};
use crate::observe::{Observer, noop_observer};
use crate::policy::{Operation, ResiliencePolicy};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backoff {
    /// Constant `base_delay` between attempts.
    Fixed,
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    Exponential,
    /// Exponential delay plus up to 50% random jitter.
    #[default]
    ExponentialWithJitter,
}

/// Outcome of one attempt, handed to the retry predicate.
#[derive(Debug)]
pub struct RetryDecision<'a, T> {
    pub attempt: usize,
    pub max_attempts: usize,
    pub outcome: std::result::Result<&'a T, &'a Error>,
}

impl<T> RetryDecision<'_, T> {
    pub fn error(&self) -> Option<&Error> {
        self.outcome.err()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.ok()
    }
}

pub type RetryPredicate<T> = Arc<dyn Fn(&RetryDecision<'_, T>) -> bool + Send + Sync>;

const JITTER_RATIO: f64 = 0.5;

/// Re-invokes an operation until it succeeds, the predicate declines, or
/// attempts run out.
///
/// When every attempt is spent on a retryable error the final error is
/// surfaced inside [`Error::RetriesExhausted`]. A retryable *result* on the
/// last attempt is returned as-is. Caller cancellation and invariant
/// violations are never retried.
pub struct RetryPolicy<T> {
    max_attempts: usize,
    backoff: Backoff,
    base_delay: Duration,
    max_delay: Duration,
    predicate: RetryPredicate<T>,
    observer: Arc<dyn Observer>,
}

impl<T> Clone for RetryPolicy<T> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            predicate: Arc::clone(&self.predicate),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<T> std::fmt::Debug for RetryPolicy<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl<T> RetryPolicy<T> {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            predicate: default_predicate(),
            observer: noop_observer(),
        }
    }

    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::ExponentialWithJitter,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            predicate: default_predicate(),
            observer: noop_observer(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    /// Replaces the retry predicate.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RetryDecision<'_, T>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Retries errors accepted by `predicate`; successful results are final.
    pub fn retry_on_errors<F>(self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_if(move |decision| decision.error().is_some_and(&predicate))
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before the attempt that follows failed attempt `attempt` (1-based).
    pub fn backoff_for_retry(&self, attempt: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => self.exponential_delay(attempt),
            Backoff::ExponentialWithJitter => apply_jitter(self.exponential_delay(attempt)),
        }
    }

    fn exponential_delay(&self, attempt: usize) -> Duration {
        let capped_exponent = attempt.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u32 << capped_exponent;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn should_retry(&self, decision: &RetryDecision<'_, T>) -> bool {
        if let Err(error) = decision.outcome
            && matches!(
                error.kind(),
                ErrorKind::Cancelled | ErrorKind::InvariantViolation
            )
        {
            return false;
        }
        (self.predicate)(decision)
    }
}

impl RetryPolicy<Response<Bytes>> {
    /// Standard policy that also retries throttling and transient server statuses.
    pub fn standard_http() -> Self {
        Self::standard().retry_if(|decision| match decision.outcome {
            Ok(response) => is_retryable_status(response.status()),
            Err(error) => error.is_operation_failure(),
        })
    }
}

impl<T> Default for RetryPolicy<T> {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_predicate<T>() -> RetryPredicate<T> {
    Arc::new(|decision: &RetryDecision<'_, T>| {
        decision.error().is_some_and(Error::is_operation_failure)
    })
}

pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

fn apply_jitter(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
    if delay_ms == 0 {
        return delay;
    }
    let jitter_span = ((delay_ms as f64) * JITTER_RATIO).round() as u64;
    let mut rng = rand::rng();
    let jitter_ms = rng.random_range(0..=jitter_span);
    Duration::from_millis(delay_ms.saturating_add(jitter_ms))
}

impl<T: Send + 'static> ResiliencePolicy<T> for RetryPolicy<T> {
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>> {
        let policy = self.clone();
        async move {
            let max_attempts = policy.max_attempts;
            let mut attempt = 1_usize;
            loop {
                let result = operation(cancel.clone()).await;
                let retryable = !cancel.is_cancelled()
                    && policy.should_retry(&RetryDecision {
                        attempt,
                        max_attempts,
                        outcome: result.as_ref(),
                    });

                if !retryable {
                    return result;
                }
                if attempt >= max_attempts {
                    return match result {
                        Err(error) if max_attempts > 1 => {
                            debug!(attempts = attempt, error = %error, "retry attempts exhausted");
                            Err(Error::RetriesExhausted {
                                attempts: attempt,
                                source: Box::new(error),
                            })
                        }
                        other => other,
                    };
                }

                let delay = policy.backoff_for_retry(attempt);
                match &result {
                    Err(error) => warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying operation after failure"
                    ),
                    Ok(_) => warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying operation after retryable result"
                    ),
                }
                policy
                    .observer
                    .on_retry_scheduled(attempt, delay, result.as_ref().err());
                drop(result);

                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
                attempt += 1;
            }
        }
        .boxed()
    }
}
