use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, ErrorKind};
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunnerMetricsSnapshot {
    pub executions_started: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub rejected: u64,
    pub deadline_exceeded: u64,
    pub cancelled: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct RunnerMetrics {
    inner: Arc<RunnerMetricsInner>,
}

#[derive(Debug, Default)]
struct RunnerMetricsInner {
    executions_started: AtomicU64,
    executions_succeeded: AtomicU64,
    executions_failed: AtomicU64,
    rejected: AtomicU64,
    deadline_exceeded: AtomicU64,
    cancelled: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Arc<RunnerMetricsInner>,
}

impl RunnerMetrics {
    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner
            .executions_started
            .fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn record_completed(&self, error: Option<&Error>, latency: Duration) {
        let inner = &self.inner;
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );

        let Some(error) = error else {
            inner.executions_succeeded.fetch_add(1, Ordering::Relaxed);
            return;
        };

        inner.executions_failed.fetch_add(1, Ordering::Relaxed);
        match error.last_attempt_error().kind() {
            ErrorKind::Rejected => {
                inner.rejected.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::DeadlineExceeded => {
                inner.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::Cancelled => {
                inner.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::OperationFailed | ErrorKind::InvariantViolation => {}
        }
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts
            .entry(error.code().as_str().to_owned())
            .or_insert(0) += 1;
    }

    pub(crate) fn snapshot(&self) -> RunnerMetricsSnapshot {
        let inner = &self.inner;
        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        RunnerMetricsSnapshot {
            executions_started: inner.executions_started.load(Ordering::Relaxed),
            executions_succeeded: inner.executions_succeeded.load(Ordering::Relaxed),
            executions_failed: inner.executions_failed.load(Ordering::Relaxed),
            rejected: inner.rejected.load(Ordering::Relaxed),
            deadline_exceeded: inner.deadline_exceeded.load(Ordering::Relaxed),
            cancelled: inner.cancelled.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RunnerMetrics;
    use crate::error::Error;

    #[test]
    fn completed_executions_are_bucketed_by_outcome() {
        let metrics = RunnerMetrics::default();

        let guard = metrics.enter_in_flight();
        assert_eq!(metrics.snapshot().in_flight, 1);
        metrics.record_completed(None, Duration::from_millis(10));
        drop(guard);

        let _guard = metrics.enter_in_flight();
        metrics.record_completed(
            Some(&Error::RetriesExhausted {
                attempts: 2,
                source: Box::new(Error::DeadlineExceeded { timeout_ms: 5 }),
            }),
            Duration::from_millis(30),
        );
        metrics.record_completed(
            Some(&Error::CircuitOpen { retry_after_ms: 1 }),
            Duration::ZERO,
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.executions_started, 2);
        assert_eq!(snapshot.executions_succeeded, 1);
        assert_eq!(snapshot.executions_failed, 2);
        assert_eq!(snapshot.deadline_exceeded, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.error_counts.get("retries_exhausted"), Some(&1));
        assert_eq!(snapshot.error_counts.get("circuit_open"), Some(&1));
        assert!((snapshot.latency_avg_ms - 40.0 / 3.0).abs() < f64::EPSILON * 100.0);
    }
}
