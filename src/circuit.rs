use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::error::{Error, invalid_config};
use crate::observe::{Observer, noop_observer};
use crate::policy::{Operation, ResiliencePolicy};
use crate::util::{duration_millis, lock_unpoisoned};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    break_duration: Duration,
}

impl CircuitBreakerConfig {
    pub const fn standard() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(10),
        }
    }

    pub const fn failure_threshold(mut self, failure_threshold: usize) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    pub const fn break_duration(mut self, break_duration: Duration) -> Self {
        self.break_duration = break_duration;
        self
    }

    pub const fn configured_failure_threshold(self) -> usize {
        self.failure_threshold
    }

    pub const fn configured_break_duration(self) -> Duration {
        self.break_duration
    }

    pub fn validate(self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid_config(
                "circuit_breaker",
                "failure_threshold must be at least 1",
            ));
        }
        if self.break_duration.is_zero() {
            return Err(invalid_config(
                "circuit_breaker",
                "break_duration must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::standard()
    }
}

pub type HandledErrorPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: usize },
    Open { opened_at: Instant },
    HalfOpen { trial_active: bool },
}

impl BreakerState {
    fn public(&self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttemptOutcome {
    Success,
    Failure,
    Ignored,
}

struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    handles: HandledErrorPredicate,
    observer: Arc<dyn Observer>,
}

type Transition = Option<(CircuitState, CircuitState)>;

impl CircuitBreaker {
    fn begin(self: &Arc<Self>) -> std::result::Result<CircuitAttempt, Duration> {
        let (attempt, transition) = {
            let mut state = lock_unpoisoned(&self.state);
            match &mut *state {
                BreakerState::Closed { .. } => (Ok(self.attempt(false)), None),
                BreakerState::Open { opened_at } => {
                    let elapsed = opened_at.elapsed();
                    if elapsed < self.config.break_duration {
                        return Err(self.config.break_duration - elapsed);
                    }
                    *state = BreakerState::HalfOpen { trial_active: true };
                    (
                        Ok(self.attempt(true)),
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                }
                BreakerState::HalfOpen { trial_active } => {
                    if *trial_active {
                        return Err(Duration::ZERO);
                    }
                    *trial_active = true;
                    (Ok(self.attempt(true)), None)
                }
            }
        };
        self.emit(transition);
        attempt
    }

    fn attempt(self: &Arc<Self>, trial: bool) -> CircuitAttempt {
        CircuitAttempt {
            breaker: Arc::clone(self),
            trial,
            completed: false,
        }
    }

    fn complete(&self, trial: bool, outcome: AttemptOutcome) {
        let transition = {
            let mut state = lock_unpoisoned(&self.state);
            let from = state.public();
            match (&mut *state, trial, outcome) {
                (BreakerState::Closed { consecutive_failures }, false, AttemptOutcome::Success) => {
                    *consecutive_failures = 0;
                }
                (BreakerState::Closed { consecutive_failures }, false, AttemptOutcome::Failure) => {
                    *consecutive_failures = consecutive_failures.saturating_add(1);
                    if *consecutive_failures >= self.config.failure_threshold.max(1) {
                        *state = BreakerState::Open {
                            opened_at: Instant::now(),
                        };
                    }
                }
                (BreakerState::HalfOpen { .. }, true, AttemptOutcome::Success) => {
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                }
                (BreakerState::HalfOpen { .. }, true, AttemptOutcome::Failure) => {
                    *state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                }
                (BreakerState::HalfOpen { trial_active }, true, AttemptOutcome::Ignored) => {
                    *trial_active = false;
                }
                _ => {}
            }
            let to = state.public();
            (from != to).then_some((from, to))
        };
        self.emit(transition);
    }

    fn reset(&self) {
        let transition = {
            let mut state = lock_unpoisoned(&self.state);
            let from = state.public();
            *state = BreakerState::Closed {
                consecutive_failures: 0,
            };
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        self.emit(transition);
    }

    fn emit(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };
        if to == CircuitState::Open {
            warn!(
                from = %from,
                break_ms = self.config.break_duration.as_millis() as u64,
                "circuit breaker opened"
            );
        } else {
            debug!(from = %from, to = %to, "circuit breaker transition");
        }
        self.observer.on_circuit_state_change(from, to);
    }
}

/// One admitted call. Dropping it without an outcome marks it abandoned.
struct CircuitAttempt {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    completed: bool,
}

impl CircuitAttempt {
    fn finish(mut self, outcome: AttemptOutcome) {
        self.completed = true;
        self.breaker.complete(self.trial, outcome);
    }
}

impl Drop for CircuitAttempt {
    fn drop(&mut self) {
        if !self.completed {
            self.completed = true;
            self.breaker.complete(self.trial, AttemptOutcome::Ignored);
        }
    }
}

/// Closed / Open / Half-Open circuit breaker shared by every clone.
///
/// Handled failures are counted consecutively while closed; any success
/// resets the count. After `break_duration` the first caller through becomes
/// the single half-open trial and every other caller is rejected with
/// [`Error::CircuitOpen`] until the trial completes. Errors outside the
/// handled set pass through without touching the state. A call abandoned
/// before completion (its future dropped) is not counted, and an abandoned
/// trial frees the trial slot.
#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    inner: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CircuitBreakerPolicy")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerPolicy {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::from_parts(
            config,
            Arc::new(Error::is_operation_failure),
            noop_observer(),
        )
    }

    pub fn standard() -> Self {
        Self::new(CircuitBreakerConfig::standard())
    }

    fn from_parts(
        config: CircuitBreakerConfig,
        handles: HandledErrorPredicate,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            inner: Arc::new(CircuitBreaker {
                config,
                state: Mutex::new(BreakerState::Closed {
                    consecutive_failures: 0,
                }),
                handles,
                observer,
            }),
        }
    }

    /// Replaces the handled-error predicate. Returns a breaker with fresh state.
    pub fn handle_errors<F>(self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        Self::from_parts(
            self.inner.config,
            Arc::new(predicate),
            Arc::clone(&self.inner.observer),
        )
    }

    /// Attaches an observer. Returns a breaker with fresh state.
    pub fn with_observer(self, observer: Arc<dyn Observer>) -> Self {
        Self::from_parts(self.inner.config, Arc::clone(&self.inner.handles), observer)
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.inner.config
    }

    /// Current state. An open breaker whose break has elapsed still reports
    /// `Open` until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        lock_unpoisoned(&self.inner.state).public()
    }

    pub fn reset(&self) {
        self.inner.reset();
    }

    pub fn validate(&self) -> Result<()> {
        self.inner.config.validate()
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl<T: Send + 'static> ResiliencePolicy<T> for CircuitBreakerPolicy {
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>> {
        let breaker = Arc::clone(&self.inner);
        async move {
            let attempt = match breaker.begin() {
                Ok(attempt) => attempt,
                Err(retry_after) => {
                    debug!(
                        retry_after_ms = retry_after.as_millis() as u64,
                        "circuit breaker rejected call"
                    );
                    return Err(Error::CircuitOpen {
                        retry_after_ms: duration_millis(retry_after),
                    });
                }
            };

            let result = operation(cancel).await;
            let outcome = match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(error) if (breaker.handles)(error) => AttemptOutcome::Failure,
                Err(_) => AttemptOutcome::Ignored,
            };
            attempt.finish(outcome);
            result
        }
        .boxed()
    }
}
