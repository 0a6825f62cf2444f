use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{Method, Uri};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::error::{Error, invalid_config};
use crate::observe::{Observer, noop_observer};
use crate::policy::{Operation, ResiliencePolicy};
use crate::session::SessionId;
use crate::util::lock_unpoisoned;

const MIN_QUEUE_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QueueOrder {
    /// Waiters are granted permits in arrival order.
    #[default]
    OldestFirst,
    /// The latest waiter is served first; a full queue evicts its oldest waiter.
    NewestFirst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimiterKind {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl std::fmt::Display for RateLimiterKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::FixedWindow => "fixed_window",
            Self::SlidingWindow => "sliding_window",
            Self::TokenBucket => "token_bucket",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedWindowConfig {
    permit_limit: usize,
    window: Duration,
    queue_limit: usize,
    queue_order: QueueOrder,
}

impl FixedWindowConfig {
    pub const fn new(permit_limit: usize, window: Duration) -> Self {
        Self {
            permit_limit,
            window,
            queue_limit: 0,
            queue_order: QueueOrder::OldestFirst,
        }
    }

    pub const fn queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    pub const fn queue_order(mut self, queue_order: QueueOrder) -> Self {
        self.queue_order = queue_order;
        self
    }

    pub const fn configured_permit_limit(self) -> usize {
        self.permit_limit
    }

    pub const fn configured_window(self) -> Duration {
        self.window
    }

    pub fn validate(self) -> Result<()> {
        if self.permit_limit == 0 {
            return Err(invalid_config(
                "fixed_window",
                "permit_limit must be at least 1",
            ));
        }
        if self.window.is_zero() {
            return Err(invalid_config(
                "fixed_window",
                "window must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    permit_limit: usize,
    window: Duration,
    segments_per_window: u32,
    queue_limit: usize,
    queue_order: QueueOrder,
}

impl SlidingWindowConfig {
    pub const fn new(permit_limit: usize, window: Duration, segments_per_window: u32) -> Self {
        Self {
            permit_limit,
            window,
            segments_per_window,
            queue_limit: 0,
            queue_order: QueueOrder::OldestFirst,
        }
    }

    pub const fn queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    pub const fn queue_order(mut self, queue_order: QueueOrder) -> Self {
        self.queue_order = queue_order;
        self
    }

    pub const fn configured_permit_limit(self) -> usize {
        self.permit_limit
    }

    pub const fn configured_window(self) -> Duration {
        self.window
    }

    pub const fn configured_segments_per_window(self) -> u32 {
        self.segments_per_window
    }

    pub fn validate(self) -> Result<()> {
        if self.permit_limit == 0 {
            return Err(invalid_config(
                "sliding_window",
                "permit_limit must be at least 1",
            ));
        }
        if self.segments_per_window == 0 {
            return Err(invalid_config(
                "sliding_window",
                "segments_per_window must be at least 1",
            ));
        }
        if self.window.is_zero() || (self.window / self.segments_per_window).is_zero() {
            return Err(invalid_config(
                "sliding_window",
                "window must be long enough to split into segments",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenBucketConfig {
    capacity: usize,
    tokens_per_second: f64,
    queue_limit: usize,
    queue_order: QueueOrder,
}

impl TokenBucketConfig {
    pub const fn new(capacity: usize, tokens_per_second: f64) -> Self {
        Self {
            capacity,
            tokens_per_second,
            queue_limit: 0,
            queue_order: QueueOrder::OldestFirst,
        }
    }

    pub const fn queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    pub const fn queue_order(mut self, queue_order: QueueOrder) -> Self {
        self.queue_order = queue_order;
        self
    }

    pub const fn configured_capacity(self) -> usize {
        self.capacity
    }

    pub const fn configured_tokens_per_second(self) -> f64 {
        self.tokens_per_second
    }

    pub fn validate(self) -> Result<()> {
        if self.capacity == 0 {
            return Err(invalid_config(
                "token_bucket",
                "capacity must be at least 1",
            ));
        }
        if !self.tokens_per_second.is_finite() || self.tokens_per_second <= 0.0 {
            return Err(invalid_config(
                "token_bucket",
                "tokens_per_second must be finite and positive",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateLimiterConfig {
    FixedWindow(FixedWindowConfig),
    SlidingWindow(SlidingWindowConfig),
    TokenBucket(TokenBucketConfig),
}

impl RateLimiterConfig {
    pub const fn kind(&self) -> RateLimiterKind {
        match self {
            Self::FixedWindow(_) => RateLimiterKind::FixedWindow,
            Self::SlidingWindow(_) => RateLimiterKind::SlidingWindow,
            Self::TokenBucket(_) => RateLimiterKind::TokenBucket,
        }
    }

    pub const fn configured_queue_limit(&self) -> usize {
        match self {
            Self::FixedWindow(config) => config.queue_limit,
            Self::SlidingWindow(config) => config.queue_limit,
            Self::TokenBucket(config) => config.queue_limit,
        }
    }

    pub const fn configured_queue_order(&self) -> QueueOrder {
        match self {
            Self::FixedWindow(config) => config.queue_order,
            Self::SlidingWindow(config) => config.queue_order,
            Self::TokenBucket(config) => config.queue_order,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::FixedWindow(config) => config.validate(),
            Self::SlidingWindow(config) => config.validate(),
            Self::TokenBucket(config) => config.validate(),
        }
    }
}

impl From<FixedWindowConfig> for RateLimiterConfig {
    fn from(config: FixedWindowConfig) -> Self {
        Self::FixedWindow(config)
    }
}

impl From<SlidingWindowConfig> for RateLimiterConfig {
    fn from(config: SlidingWindowConfig) -> Self {
        Self::SlidingWindow(config)
    }
}

impl From<TokenBucketConfig> for RateLimiterConfig {
    fn from(config: TokenBucketConfig) -> Self {
        Self::TokenBucket(config)
    }
}

#[derive(Debug)]
struct FixedWindow {
    permit_limit: usize,
    window: Duration,
    window_start: Instant,
    used: usize,
}

impl FixedWindow {
    fn replenish(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return;
        }
        let into_window = elapsed.as_nanos() % self.window.as_nanos();
        self.window_start = now - Duration::from_nanos(into_window as u64);
        self.used = 0;
    }

    fn try_take(&mut self) -> bool {
        if self.used >= self.permit_limit {
            return false;
        }
        self.used += 1;
        true
    }

    fn next_available(&self, now: Instant) -> Duration {
        if self.used < self.permit_limit {
            return Duration::ZERO;
        }
        (self.window_start + self.window).saturating_duration_since(now)
    }
}

/// Ring of per-segment permit counts; the slot after `current` is the oldest.
#[derive(Debug)]
struct SlidingWindow {
    permit_limit: usize,
    segment: Duration,
    counts: Vec<usize>,
    current: usize,
    segment_start: Instant,
    total: usize,
}

impl SlidingWindow {
    fn replenish(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.segment_start);
        if elapsed < self.segment {
            return;
        }
        let segment_nanos = self.segment.as_nanos();
        let steps = (elapsed.as_nanos() / segment_nanos).min(self.counts.len() as u128) as usize;
        for _ in 0..steps {
            self.current = (self.current + 1) % self.counts.len();
            self.total -= self.counts[self.current];
            self.counts[self.current] = 0;
        }
        let into_segment = elapsed.as_nanos() % segment_nanos;
        self.segment_start = now - Duration::from_nanos(into_segment as u64);
    }

    fn try_take(&mut self) -> bool {
        if self.total >= self.permit_limit {
            return false;
        }
        self.counts[self.current] += 1;
        self.total += 1;
        true
    }

    fn next_available(&self, now: Instant) -> Duration {
        if self.total < self.permit_limit {
            return Duration::ZERO;
        }
        let segments = self.counts.len();
        (1..=segments)
            .find(|step| self.counts[(self.current + step) % segments] > 0)
            .map_or(self.segment, |step| {
                (self.segment_start + self.segment * step as u32).saturating_duration_since(now)
            })
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens_per_second: f64,
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn replenish(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        self.tokens = (self.tokens + elapsed_secs * self.tokens_per_second).min(self.capacity);
    }

    fn try_take(&mut self) -> bool {
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens = (self.tokens - 1.0).max(0.0);
        true
    }

    fn next_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let delay_secs = (1.0 - self.tokens).max(0.0) / self.tokens_per_second;
        if delay_secs <= f64::EPSILON {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

#[derive(Debug)]
enum Algorithm {
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindow),
    TokenBucket(TokenBucket),
}

impl Algorithm {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        match *config {
            RateLimiterConfig::FixedWindow(config) => Self::FixedWindow(FixedWindow {
                permit_limit: config.permit_limit,
                window: config.window,
                window_start: now,
                used: 0,
            }),
            RateLimiterConfig::SlidingWindow(config) => {
                let segments = config.segments_per_window.max(1);
                Self::SlidingWindow(SlidingWindow {
                    permit_limit: config.permit_limit,
                    segment: (config.window / segments).max(Duration::from_nanos(1)),
                    counts: vec![0; segments as usize],
                    current: 0,
                    segment_start: now,
                    total: 0,
                })
            }
            RateLimiterConfig::TokenBucket(config) => Self::TokenBucket(TokenBucket {
                capacity: config.capacity as f64,
                tokens_per_second: config.tokens_per_second,
                tokens: config.capacity as f64,
                last_refill_at: now,
            }),
        }
    }

    fn replenish(&mut self, now: Instant) {
        match self {
            Self::FixedWindow(window) => window.replenish(now),
            Self::SlidingWindow(window) => window.replenish(now),
            Self::TokenBucket(bucket) => bucket.replenish(now),
        }
    }

    fn try_take(&mut self) -> bool {
        match self {
            Self::FixedWindow(window) => window.try_take(),
            Self::SlidingWindow(window) => window.try_take(),
            Self::TokenBucket(bucket) => bucket.try_take(),
        }
    }

    fn next_available(&self, now: Instant) -> Duration {
        match self {
            Self::FixedWindow(window) => window.next_available(now),
            Self::SlidingWindow(window) => window.next_available(now),
            Self::TokenBucket(bucket) => bucket.next_available(),
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    algorithm: Algorithm,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

impl LimiterState {
    fn is_head(&self, ticket: u64, order: QueueOrder) -> bool {
        let head = match order {
            QueueOrder::OldestFirst => self.waiters.front(),
            QueueOrder::NewestFirst => self.waiters.back(),
        };
        head == Some(&ticket)
    }

    fn remove(&mut self, ticket: u64) -> bool {
        match self.waiters.iter().position(|waiter| *waiter == ticket) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

enum Admission {
    Granted,
    Queued(u64),
}

struct Limiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    notify: Notify,
    observer: Arc<dyn Observer>,
}

impl Limiter {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Duration> {
        let started = Instant::now();
        let ticket = match self.admit(started)? {
            Admission::Granted => return Ok(self.granted(started)),
            Admission::Queued(ticket) => ticket,
        };
        let _guard = QueuedTicket {
            limiter: self,
            ticket,
        };
        let order = self.config.configured_queue_order();

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = lock_unpoisoned(&self.state);
                if !state.waiters.contains(&ticket) {
                    drop(state);
                    return Err(self.rejected("evicted from queue"));
                }
                let now = Instant::now();
                state.algorithm.replenish(now);
                if state.is_head(ticket, order) && state.algorithm.try_take() {
                    state.remove(ticket);
                    drop(state);
                    self.notify.notify_waiters();
                    return Ok(self.granted(started));
                }
                state.algorithm.next_available(now)
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut notified => {}
                _ = sleep(wait.max(MIN_QUEUE_POLL)) => {}
            }
        }
    }

    fn admit(&self, now: Instant) -> Result<Admission> {
        let queue_limit = self.config.configured_queue_limit();
        let mut state = lock_unpoisoned(&self.state);
        state.algorithm.replenish(now);
        if state.waiters.is_empty() && state.algorithm.try_take() {
            return Ok(Admission::Granted);
        }

        let evicted = if state.waiters.len() < queue_limit {
            false
        } else if queue_limit > 0
            && self.config.configured_queue_order() == QueueOrder::NewestFirst
        {
            state.waiters.pop_front();
            true
        } else {
            drop(state);
            return Err(self.rejected("queue full"));
        };

        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1);
        state.waiters.push_back(ticket);
        drop(state);
        if evicted {
            self.notify.notify_waiters();
        }
        Ok(Admission::Queued(ticket))
    }

    fn granted(&self, started: Instant) -> Duration {
        let waited = started.elapsed();
        let kind = self.config.kind();
        debug!(
            limiter = %kind,
            wait_ms = waited.as_millis() as u64,
            "rate limiter permit acquired"
        );
        self.observer.on_permit_acquired(kind, waited);
        waited
    }

    fn rejected(&self, reason: &'static str) -> Error {
        let kind = self.config.kind();
        let queue_limit = self.config.configured_queue_limit();
        debug!(limiter = %kind, queue_limit, reason, "rate limiter rejected call");
        self.observer.on_permit_rejected(kind, queue_limit);
        Error::RateLimited { queue_limit }
    }
}

struct QueuedTicket<'a> {
    limiter: &'a Limiter,
    ticket: u64,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        let removed = lock_unpoisoned(&self.limiter.state).remove(self.ticket);
        if removed {
            self.limiter.notify.notify_waiters();
        }
    }
}

/// Admission control with fixed-window, sliding-window or token-bucket
/// accounting and a bounded wait queue.
///
/// Clones share one limiter. A caller that cannot be admitted immediately
/// waits in the queue; a full queue rejects with [`Error::RateLimited`].
#[derive(Clone)]
pub struct RateLimiterPolicy {
    inner: Arc<Limiter>,
}

impl std::fmt::Debug for RateLimiterPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RateLimiterPolicy")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiterPolicy {
    pub fn new(config: impl Into<RateLimiterConfig>) -> Result<Self> {
        Self::with_parts(config.into(), noop_observer())
    }

    fn with_parts(config: RateLimiterConfig, observer: Arc<dyn Observer>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Limiter {
                config,
                state: Mutex::new(LimiterState {
                    algorithm: Algorithm::new(&config, Instant::now()),
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
                notify: Notify::new(),
                observer,
            }),
        })
    }

    /// Attaches an observer. Returns a limiter with fresh state.
    pub fn with_observer(self, observer: Arc<dyn Observer>) -> Self {
        let config = self.inner.config;
        Self::with_parts(config, observer).unwrap_or(self)
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.inner.config
    }

    pub fn kind(&self) -> RateLimiterKind {
        self.inner.config.kind()
    }

    /// Waits for one permit and returns how long acquisition took.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Duration> {
        self.inner.acquire(cancel).await
    }

    pub fn queued(&self) -> usize {
        lock_unpoisoned(&self.inner.state).waiters.len()
    }
}

impl<T: Send + 'static> ResiliencePolicy<T> for RateLimiterPolicy {
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>> {
        let limiter = Arc::clone(&self.inner);
        async move {
            limiter.acquire(&cancel).await?;
            operation(cancel).await
        }
        .boxed()
    }
}

tokio::task_local! {
    static CURRENT_REQUEST: RequestContext;
}

/// The request currently being executed on this task.
#[derive(Clone, Debug)]
pub struct RequestContext {
    session_id: Option<SessionId>,
    method: Method,
    uri: Uri,
}

impl RequestContext {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            session_id: None,
            method,
            uri,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn host(&self) -> Option<&str> {
        self.uri.host()
    }

    /// Context installed by the innermost enclosing [`RequestContext::scope`].
    pub fn current() -> Option<Self> {
        CURRENT_REQUEST.try_with(Clone::clone).ok()
    }

    /// Runs `future` with `self` as the current request. The context is
    /// removed when the future completes or is dropped.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        CURRENT_REQUEST.scope(self, future).await
    }
}

pub type RateLimiterResolver =
    Arc<dyn Fn(&RequestContext) -> Option<RateLimiterPolicy> + Send + Sync>;

/// Chooses a per-request limiter from the current [`RequestContext`].
///
/// The resolver runs once per call; `None`, or no request in scope, falls
/// back to the global limiter.
#[derive(Clone)]
pub struct RateLimiterRouter {
    global: RateLimiterPolicy,
    resolver: RateLimiterResolver,
}

impl std::fmt::Debug for RateLimiterRouter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RateLimiterRouter")
            .field("global", &self.global)
            .finish_non_exhaustive()
    }
}

impl RateLimiterRouter {
    pub fn new<F>(global: RateLimiterPolicy, resolver: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<RateLimiterPolicy> + Send + Sync + 'static,
    {
        Self {
            global,
            resolver: Arc::new(resolver),
        }
    }

    pub fn global(&self) -> &RateLimiterPolicy {
        &self.global
    }

    fn resolve(&self) -> RateLimiterPolicy {
        RequestContext::current()
            .and_then(|request| (self.resolver)(&request))
            .unwrap_or_else(|| self.global.clone())
    }
}

impl<T: Send + 'static> ResiliencePolicy<T> for RateLimiterRouter {
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>> {
        let router = self.clone();
        async move {
            let limiter = router.resolve();
            limiter.inner.acquire(&cancel).await?;
            operation(cancel).await
        }
        .boxed()
    }
}
