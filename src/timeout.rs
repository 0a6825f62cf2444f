use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::error::{Error, invalid_config};
use crate::observe::{Observer, noop_observer};
use crate::policy::{Operation, ResiliencePolicy};
use crate::util::duration_millis;

/// Where a timeout sits in the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeoutScope {
    /// Outside retry: one deadline shared by every attempt.
    Total,
    /// Innermost: each attempt gets its own deadline.
    Attempt,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Total => "total",
            Self::Attempt => "attempt",
        };
        formatter.write_str(text)
    }
}

/// Bounds an operation with a deadline linked to the caller's token.
///
/// The operation receives a child of the caller's token which is cancelled
/// when the deadline fires, so cooperative work stops early. Work that
/// ignores its token is dropped at the deadline. A deadline is reported as
/// [`Error::DeadlineExceeded`]; the caller's own cancellation is reported as
/// [`Error::Cancelled`].
#[derive(Clone)]
pub struct TimeoutPolicy {
    timeout: Duration,
    scope: TimeoutScope,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for TimeoutPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TimeoutPolicy")
            .field("timeout", &self.timeout)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl TimeoutPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            scope: TimeoutScope::Total,
            observer: noop_observer(),
        }
    }

    pub fn per_attempt(timeout: Duration) -> Self {
        Self {
            scope: TimeoutScope::Attempt,
            ..Self::new(timeout)
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn scope(&self) -> TimeoutScope {
        self.scope
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(invalid_config("timeout", "timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl<T: Send + 'static> ResiliencePolicy<T> for TimeoutPolicy {
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>> {
        let timeout = self.timeout;
        let scope = self.scope;
        let observer = Arc::clone(&self.observer);
        async move {
            let linked = cancel.child_token();
            let work = operation(linked.clone());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    linked.cancel();
                    Err(Error::Cancelled)
                }
                result = work => result,
                _ = sleep(timeout) => {
                    linked.cancel();
                    debug!(scope = %scope, timeout_ms = timeout.as_millis() as u64, "deadline exceeded");
                    observer.on_deadline_exceeded(scope, timeout);
                    Err(Error::DeadlineExceeded {
                        timeout_ms: duration_millis(timeout),
                    })
                }
            }
        }
        .boxed()
    }
}
