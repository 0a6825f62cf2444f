use std::time::{Duration, SystemTime};

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::circuit::CircuitState;
use crate::error::Error;
use crate::observe::Observer;
use crate::rate_limit::RateLimiterKind;
use crate::session::SessionId;
use crate::timeout::TimeoutScope;

/// [`Observer`] that exports policy and session events as OpenTelemetry
/// metrics. Session identities are never used as attributes.
pub struct OtelObserver {
    permits_acquired: Counter<u64>,
    permit_wait_ms: Histogram<f64>,
    permits_rejected: Counter<u64>,
    retries: Counter<u64>,
    deadlines_exceeded: Counter<u64>,
    circuit_transitions: Counter<u64>,
    executions: Counter<u64>,
    execution_latency_ms: Histogram<f64>,
    refreshes: Counter<u64>,
    sessions_disposed: Counter<u64>,
    sessions_swept: Counter<u64>,
}

impl std::fmt::Debug for OtelObserver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("OtelObserver").finish_non_exhaustive()
    }
}

impl OtelObserver {
    /// Records through the global meter provider.
    pub fn new() -> Self {
        Self::with_meter(&global::meter("sessionx"))
    }

    pub fn with_meter(meter: &Meter) -> Self {
        Self {
            permits_acquired: meter
                .u64_counter("sessionx.rate_limiter.permits")
                .with_description("Permits granted by rate limiters")
                .build(),
            permit_wait_ms: meter
                .f64_histogram("sessionx.rate_limiter.wait.ms")
                .with_unit("ms")
                .with_description("Time spent queued for a permit")
                .build(),
            permits_rejected: meter
                .u64_counter("sessionx.rate_limiter.rejected")
                .with_description("Callers rejected by a full rate limiter queue")
                .build(),
            retries: meter
                .u64_counter("sessionx.retry.scheduled")
                .with_description("Retry attempts scheduled")
                .build(),
            deadlines_exceeded: meter
                .u64_counter("sessionx.timeout.exceeded")
                .with_description("Deadlines fired by timeout policies")
                .build(),
            circuit_transitions: meter
                .u64_counter("sessionx.circuit.transitions")
                .with_description("Circuit breaker state transitions")
                .build(),
            executions: meter
                .u64_counter("sessionx.executions")
                .with_description("Completed policy pipeline executions")
                .build(),
            execution_latency_ms: meter
                .f64_histogram("sessionx.execution.duration.ms")
                .with_unit("ms")
                .with_description("End-to-end pipeline latency in milliseconds")
                .build(),
            refreshes: meter
                .u64_counter("sessionx.session.refreshes")
                .with_description("Background credential refreshes")
                .build(),
            sessions_disposed: meter
                .u64_counter("sessionx.session.disposed")
                .with_description("Sessions disposed")
                .build(),
            sessions_swept: meter
                .u64_counter("sessionx.registry.swept")
                .with_description("Sessions removed by registry sweeps")
                .build(),
        }
    }
}

impl Default for OtelObserver {
    fn default() -> Self {
        Self::new()
    }
}

fn milliseconds(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn limiter_attribute(limiter: RateLimiterKind) -> KeyValue {
    KeyValue::new("sessionx.rate_limiter", limiter.to_string())
}

fn outcome_attributes(error: Option<&Error>) -> [KeyValue; 1] {
    match error {
        None => [KeyValue::new("outcome", "success")],
        Some(error) => [KeyValue::new("error.type", error.code().as_str())],
    }
}

impl Observer for OtelObserver {
    fn on_permit_acquired(&self, limiter: RateLimiterKind, wait: Duration) {
        let attributes = [limiter_attribute(limiter)];
        self.permits_acquired.add(1, &attributes);
        self.permit_wait_ms.record(milliseconds(wait), &attributes);
    }

    fn on_permit_rejected(&self, limiter: RateLimiterKind, _queue_limit: usize) {
        self.permits_rejected.add(1, &[limiter_attribute(limiter)]);
    }

    fn on_retry_scheduled(&self, _attempt: usize, _delay: Duration, error: Option<&Error>) {
        self.retries.add(1, &outcome_attributes(error));
    }

    fn on_deadline_exceeded(&self, scope: TimeoutScope, _timeout: Duration) {
        let scope = match scope {
            TimeoutScope::Total => "total",
            TimeoutScope::Attempt => "attempt",
        };
        self.deadlines_exceeded
            .add(1, &[KeyValue::new("sessionx.timeout.scope", scope)]);
    }

    fn on_circuit_state_change(&self, from: CircuitState, to: CircuitState) {
        self.circuit_transitions.add(
            1,
            &[
                KeyValue::new("sessionx.circuit.from", from.to_string()),
                KeyValue::new("sessionx.circuit.to", to.to_string()),
            ],
        );
    }

    fn on_execution_completed(&self, error: Option<&Error>, latency: Duration) {
        let attributes = outcome_attributes(error);
        self.executions.add(1, &attributes);
        self.execution_latency_ms
            .record(milliseconds(latency), &attributes);
    }

    fn on_refresh_succeeded(&self, _session: SessionId, _expires_at: SystemTime) {
        self.refreshes.add(1, &[KeyValue::new("outcome", "success")]);
    }

    fn on_refresh_failed(&self, _session: SessionId, error: &Error) {
        self.refreshes
            .add(1, &[KeyValue::new("error.type", error.code().as_str())]);
    }

    fn on_session_disposed(&self, _session: SessionId) {
        self.sessions_disposed.add(1, &[]);
    }

    fn on_sessions_swept(&self, removed: usize) {
        if removed > 0 {
            self.sessions_swept
                .add(u64::try_from(removed).unwrap_or(u64::MAX), &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OtelObserver, outcome_attributes};
    use crate::error::Error;
    use crate::observe::Observer;
    use crate::rate_limit::RateLimiterKind;

    #[test]
    fn outcome_attributes_carry_the_error_code() {
        let [success] = outcome_attributes(None);
        assert_eq!(success.key.as_str(), "outcome");

        let [failure] = outcome_attributes(Some(&Error::RegistryDisposed));
        assert_eq!(failure.key.as_str(), "error.type");
        assert_eq!(failure.value.to_string(), "registry_disposed");
    }

    #[test]
    fn recording_without_a_provider_is_harmless() {
        let observer = OtelObserver::new();
        observer.on_permit_rejected(RateLimiterKind::TokenBucket, 4);
        observer.on_sessions_swept(3);
    }
}
