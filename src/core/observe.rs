use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::circuit::CircuitState;
use crate::error::Error;
use crate::rate_limit::RateLimiterKind;
use crate::session::SessionId;
use crate::timeout::TimeoutScope;

/// Side-effecting hooks fired at policy and session boundaries.
///
/// Every method defaults to a no-op, so implementors only override what they
/// export. Hooks run inline on the calling task and must not block.
pub trait Observer: Send + Sync {
    fn on_permit_acquired(&self, _limiter: RateLimiterKind, _wait: Duration) {}

    fn on_permit_rejected(&self, _limiter: RateLimiterKind, _queue_limit: usize) {}

    fn on_retry_scheduled(&self, _attempt: usize, _delay: Duration, _error: Option<&Error>) {}

    fn on_deadline_exceeded(&self, _scope: TimeoutScope, _timeout: Duration) {}

    fn on_circuit_state_change(&self, _from: CircuitState, _to: CircuitState) {}

    fn on_execution_completed(&self, _error: Option<&Error>, _latency: Duration) {}

    fn on_refresh_succeeded(&self, _session: SessionId, _expires_at: SystemTime) {}

    fn on_refresh_failed(&self, _session: SessionId, _error: &Error) {}

    fn on_session_disposed(&self, _session: SessionId) {}

    fn on_sessions_swept(&self, _removed: usize) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

pub(crate) fn noop_observer() -> Arc<dyn Observer> {
    Arc::new(NoopObserver)
}
