//! A session owns one authenticator, one transport and one policy pipeline.
//!
//! Sessions with a refreshable authenticator run a background task that
//! renews the credential ahead of expiry. Disposal stops that task and
//! notifies subscribers exactly once.

use std::num::NonZeroU128;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{Request, Response};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::auth::{Authenticator, RefreshableAuthenticator};
use crate::error::Error;
use crate::metrics::RunnerMetricsSnapshot;
use crate::observe::{Observer, noop_observer};
use crate::policy::operation;
use crate::rate_limit::RequestContext;
use crate::runner::PolicyRunner;
use crate::transport::{Transport, clone_request};
use crate::util::{lock_unpoisoned, millis_to_system_time, system_time_to_millis, time_until};

/// Random 128-bit session identity. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(NonZeroU128);

impl SessionId {
    pub fn random() -> Self {
        loop {
            if let Some(value) = NonZeroU128::new(rand::random::<u128>()) {
                return Self(value);
            }
        }
    }

    pub const fn from_u128(value: u128) -> Option<Self> {
        match NonZeroU128::new(value) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    pub const fn as_u128(self) -> u128 {
        self.0.get()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{:032x}", self.0.get())
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "SessionId({self})")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid session id: expected 32 hex digits, not all zero")]
pub struct ParseSessionIdError;

impl FromStr for SessionId {
    type Err = ParseSessionIdError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        if value.len() != 32 {
            return Err(ParseSessionIdError);
        }
        u128::from_str_radix(value, 16)
            .ok()
            .and_then(Self::from_u128)
            .ok_or(ParseSessionIdError)
    }
}

/// When the background loop renews a refreshable credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshSchedule {
    refresh_margin: Duration,
    min_interval: Duration,
}

impl RefreshSchedule {
    pub const fn standard() -> Self {
        Self {
            refresh_margin: Duration::from_secs(60),
            min_interval: Duration::from_secs(30),
        }
    }

    /// Refresh once the credential expires within this margin.
    pub const fn refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    /// Lower bound on the sleep between checks.
    pub const fn min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub const fn configured_refresh_margin(self) -> Duration {
        self.refresh_margin
    }

    pub const fn configured_min_interval(self) -> Duration {
        self.min_interval
    }

    /// Sleep before the next check given the current time to expiry.
    pub fn next_wait(self, time_to_expiry: Duration) -> Duration {
        (time_to_expiry / 2).max(self.min_interval)
    }
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

/// Handle returned by [`Session::subscribe_disposed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DisposeSubscription(u64);

type DisposeListener = Box<dyn FnOnce(SessionId) + Send>;

#[derive(Default)]
struct DisposeListeners {
    fired: bool,
    next_id: u64,
    entries: Vec<(u64, DisposeListener)>,
}

pub struct Session {
    id: SessionId,
    created_at: SystemTime,
    last_used_ms: AtomicU64,
    transport: Arc<dyn Transport>,
    authenticator: Authenticator,
    runner: PolicyRunner<Response<Bytes>>,
    observer: Arc<dyn Observer>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    refresh_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<DisposeListeners>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at())
            .field("authenticator", &self.authenticator)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn builder(transport: Arc<dyn Transport>, authenticator: Authenticator) -> SessionBuilder {
        SessionBuilder {
            transport,
            authenticator,
            runner: None,
            refresh_schedule: RefreshSchedule::standard(),
            observer: None,
            id: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_used_at(&self) -> SystemTime {
        millis_to_system_time(self.last_used_ms.load(Ordering::Acquire))
    }

    /// Records use now. Concurrent touches never move `last_used_at` backwards.
    pub fn touch(&self) {
        self.last_used_ms
            .fetch_max(system_time_to_millis(SystemTime::now()), Ordering::AcqRel);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn metrics_snapshot(&self) -> RunnerMetricsSnapshot {
        self.runner.metrics_snapshot()
    }

    /// Whether the credential refresh loop is still running.
    pub async fn is_refreshing(&self) -> bool {
        self.refresh_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Authenticates `request` once, then sends it through the policy pipeline.
    ///
    /// Every attempt sends its own copy of the authenticated request. The
    /// request is the [`RequestContext::current`] value for the whole call.
    pub async fn execute(
        &self,
        mut request: Request<Bytes>,
        cancel: CancellationToken,
    ) -> Result<Response<Bytes>> {
        if self.is_disposed() || self.shutdown.is_cancelled() {
            return Err(Error::SessionDisposed { id: self.id });
        }
        self.touch();

        let span = info_span!(
            "sessionx.session.execute",
            session = %self.id,
            method = %request.method(),
            uri = %request.uri()
        );
        let context = RequestContext::new(request.method().clone(), request.uri().clone())
            .with_session(self.id);

        async move {
            self.authenticator.authenticate(&mut request, &cancel).await?;

            let transport = Arc::clone(&self.transport);
            let request = Arc::new(request);
            let send = operation(move |cancel| {
                let transport = Arc::clone(&transport);
                let request = clone_request(&request);
                async move { transport.send(request, cancel).await }
            });
            context.scope(self.runner.execute(send, cancel)).await
        }
        .instrument(span)
        .await
    }

    /// Renews a refreshable credential now. A no-op for plain authenticators.
    pub async fn refresh_credentials(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::SessionDisposed { id: self.id });
        }
        let Some(authenticator) = self.authenticator.as_refreshable() else {
            return Ok(());
        };
        match authenticator.refresh(cancel).await {
            Ok(()) => {
                self.observer
                    .on_refresh_succeeded(self.id, authenticator.expires_at());
                Ok(())
            }
            Err(error) => {
                self.observer.on_refresh_failed(self.id, &error);
                Err(error)
            }
        }
    }

    /// Registers `listener` to run once when the session is disposed. If the
    /// session is already disposed the listener runs immediately.
    pub fn subscribe_disposed<F>(&self, listener: F) -> DisposeSubscription
    where
        F: FnOnce(SessionId) + Send + 'static,
    {
        let mut listeners = lock_unpoisoned(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id = listeners.next_id.wrapping_add(1);
        if listeners.fired {
            drop(listeners);
            listener(self.id);
        } else {
            listeners.entries.push((id, Box::new(listener)));
        }
        DisposeSubscription(id)
    }

    pub fn unsubscribe_disposed(&self, subscription: DisposeSubscription) -> bool {
        let mut listeners = lock_unpoisoned(&self.listeners);
        let before = listeners.entries.len();
        listeners.entries.retain(|(id, _)| *id != subscription.0);
        listeners.entries.len() != before
    }

    /// Stops the refresh loop, waits for it, marks the session disposed and
    /// notifies subscribers. Idempotent; concurrent callers wait for the
    /// first disposal to finish.
    pub async fn dispose(&self) {
        let mut refresh_task = self.refresh_task.lock().await;
        if self.is_disposed() {
            return;
        }

        self.shutdown.cancel();
        if let Some(task) = refresh_task.take()
            && let Err(error) = task.await
        {
            warn!(session = %self.id, error = %error, "credential refresh task panicked");
        }

        let entries = {
            let mut listeners = lock_unpoisoned(&self.listeners);
            self.disposed.store(true, Ordering::Release);
            listeners.fired = true;
            std::mem::take(&mut listeners.entries)
        };
        drop(refresh_task);

        debug!(session = %self.id, listeners = entries.len(), "session disposed");
        self.observer.on_session_disposed(self.id);
        for (_, listener) in entries {
            listener(self.id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn refresh_loop(
    id: SessionId,
    authenticator: Arc<dyn RefreshableAuthenticator>,
    schedule: RefreshSchedule,
    observer: Arc<dyn Observer>,
    cancel: CancellationToken,
) {
    debug!(session = %id, "credential refresh loop started");
    loop {
        let mut time_to_expiry = time_until(authenticator.expires_at(), SystemTime::now());
        if time_to_expiry <= schedule.refresh_margin {
            match authenticator.refresh(&cancel).await {
                Ok(()) => {
                    let expires_at = authenticator.expires_at();
                    debug!(session = %id, "credential refreshed");
                    observer.on_refresh_succeeded(id, expires_at);
                    time_to_expiry = time_until(expires_at, SystemTime::now());
                }
                Err(_) if cancel.is_cancelled() => break,
                Err(error) => {
                    warn!(session = %id, error = %error, "credential refresh failed");
                    observer.on_refresh_failed(id, &error);
                }
            }
        }

        let wait = schedule.next_wait(time_to_expiry);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(wait) => {}
        }
    }
    debug!(session = %id, "credential refresh loop stopped");
}

pub struct SessionBuilder {
    transport: Arc<dyn Transport>,
    authenticator: Authenticator,
    runner: Option<PolicyRunner<Response<Bytes>>>,
    refresh_schedule: RefreshSchedule,
    observer: Option<Arc<dyn Observer>>,
    id: Option<SessionId>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionBuilder")
            .field("authenticator", &self.authenticator)
            .field("refresh_schedule", &self.refresh_schedule)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    pub fn policy_runner(mut self, runner: PolicyRunner<Response<Bytes>>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn refresh_schedule(mut self, refresh_schedule: RefreshSchedule) -> Self {
        self.refresh_schedule = refresh_schedule;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Uses a caller-chosen identity instead of a random one.
    pub fn id(mut self, id: SessionId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn configured_id(&self) -> Option<SessionId> {
        self.id
    }

    /// Builds the session and, for a refreshable authenticator whose
    /// credential has not yet expired, starts the refresh loop. Starting the
    /// loop requires a tokio runtime.
    pub fn build(self) -> Result<Arc<Session>> {
        let id = self.id.unwrap_or_else(SessionId::random);
        let observer = self.observer.unwrap_or_else(noop_observer);
        let now = SystemTime::now();
        let shutdown = CancellationToken::new();

        let refresh_task = match self.authenticator.as_refreshable() {
            Some(authenticator) if authenticator.expires_at() > now => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                    Error::RuntimeUnavailable {
                        component: "session refresh loop",
                    }
                })?;
                Some(runtime.spawn(refresh_loop(
                    id,
                    Arc::clone(authenticator),
                    self.refresh_schedule,
                    Arc::clone(&observer),
                    shutdown.clone(),
                )))
            }
            _ => None,
        };

        Ok(Arc::new(Session {
            id,
            created_at: now,
            last_used_ms: AtomicU64::new(system_time_to_millis(now)),
            transport: self.transport,
            authenticator: self.authenticator,
            runner: self.runner.unwrap_or_default(),
            observer,
            disposed: AtomicBool::new(false),
            shutdown,
            refresh_task: tokio::sync::Mutex::new(refresh_task),
            listeners: Mutex::new(DisposeListeners::default()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::header::AUTHORIZATION;
    use http::{Request, Response, StatusCode};
    use tokio_util::sync::CancellationToken;

    use super::{RefreshSchedule, Session, SessionId};
    use crate::auth::{Authenticator, IssuedToken, TokenAuthenticator, TokenSource};
    use crate::error::{Error, ErrorCode};
    use crate::rate_limit::RequestContext;
    use crate::transport::{Transport, transport_fn};

    fn echo_auth_transport() -> Arc<dyn Transport> {
        Arc::new(transport_fn(|request: Request<Bytes>, _cancel| async move {
            let seen = request
                .headers()
                .get(AUTHORIZATION)
                .map(|value| Bytes::copy_from_slice(value.as_bytes()))
                .unwrap_or_default();
            let current = RequestContext::current().and_then(|context| context.session_id());
            let mut response = Response::new(seen);
            if current.is_some() {
                *response.status_mut() = StatusCode::OK;
            } else {
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            }
            Ok(response)
        }))
    }

    struct ScriptedSource {
        fetches: AtomicUsize,
        fail: bool,
        lifetime: Duration,
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        async fn fetch(&self, _cancel: &CancellationToken) -> crate::Result<IssuedToken> {
            let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(Error::authentication("issuer unavailable"));
            }
            Ok(IssuedToken::new(
                format!("token-{fetch}"),
                SystemTime::now() + self.lifetime,
            ))
        }
    }

    fn token_authenticator(
        fail: bool,
        expires_in: Duration,
    ) -> Arc<TokenAuthenticator<ScriptedSource>> {
        Arc::new(
            TokenAuthenticator::with_token(
                ScriptedSource {
                    fetches: AtomicUsize::new(0),
                    fail,
                    lifetime: Duration::from_secs(3600),
                },
                IssuedToken::new("initial", SystemTime::now() + expires_in),
            )
            .expect("valid token"),
        )
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within one second");
    }

    #[test]
    fn session_ids_are_non_zero_and_render_as_hex() {
        let id = SessionId::random();
        assert_ne!(id.as_u128(), 0);
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 32);
        assert_eq!(rendered.parse::<SessionId>().expect("round trips"), id);
        assert!(SessionId::from_u128(0).is_none());
        assert!("0".repeat(32).parse::<SessionId>().is_err());
    }

    #[test]
    fn refresh_wait_is_half_the_remaining_lifetime_with_a_floor() {
        let schedule = RefreshSchedule::standard();
        assert_eq!(schedule.next_wait(Duration::from_secs(3600)), Duration::from_secs(1800));
        assert_eq!(schedule.next_wait(Duration::from_secs(20)), Duration::from_secs(30));
        assert_eq!(schedule.next_wait(Duration::ZERO), Duration::from_secs(30));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn execute_authenticates_and_scopes_the_request() {
        let session = Session::builder(
            echo_auth_transport(),
            Authenticator::plain(
                crate::auth::HeaderAuthenticator::bearer("static").expect("valid token"),
            ),
        )
        .build()
        .expect("session builds");
        let before = session.last_used_at();

        let response = session
            .execute(Request::new(Bytes::new()), CancellationToken::new())
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK, "request context was in scope");
        assert_eq!(response.body(), &Bytes::from_static(b"Bearer static"));
        assert!(session.last_used_at() >= before);
        assert!(RequestContext::current().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disposed_session_rejects_execution() {
        let session = Session::builder(echo_auth_transport(), Authenticator::none())
            .build()
            .expect("session builds");
        session.dispose().await;
        let error = session
            .execute(Request::new(Bytes::new()), CancellationToken::new())
            .await
            .expect_err("disposed session refuses work");
        assert_eq!(error.code(), ErrorCode::SessionDisposed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dispose_notifies_subscribers_exactly_once() {
        let session = Session::builder(echo_auth_transport(), Authenticator::none())
            .build()
            .expect("session builds");
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        session.subscribe_disposed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let removed = Arc::clone(&notified);
        let subscription = session.subscribe_disposed(move |_| {
            removed.fetch_add(100, Ordering::SeqCst);
        });
        assert!(session.unsubscribe_disposed(subscription));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.dispose().await }));
        }
        for handle in handles {
            handle.await.expect("dispose task should join");
        }
        assert!(session.is_disposed());
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&notified);
        session.subscribe_disposed(move |_| {
            late.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(notified.load(Ordering::SeqCst), 11, "late subscriber runs immediately");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refresh_loop_renews_credentials_near_expiry() {
        let authenticator = token_authenticator(false, Duration::from_secs(30));
        let session = Session::builder(
            echo_auth_transport(),
            Authenticator::Refreshable(authenticator.clone()),
        )
        .build()
        .expect("session builds");
        assert!(session.is_refreshing().await);

        wait_for(|| authenticator.source().fetches.load(Ordering::SeqCst) == 1).await;
        wait_for(|| {
            crate::auth::RefreshableAuthenticator::expires_at(authenticator.as_ref())
                > SystemTime::now() + Duration::from_secs(3000)
        })
        .await;

        session.dispose().await;
        assert!(!session.is_refreshing().await);
        assert_eq!(authenticator.source().fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refresh_failures_do_not_stop_the_loop() {
        let authenticator = token_authenticator(true, Duration::from_millis(20));
        let session = Session::builder(
            echo_auth_transport(),
            Authenticator::Refreshable(authenticator.clone()),
        )
        .refresh_schedule(RefreshSchedule::standard().min_interval(Duration::from_millis(10)))
        .build()
        .expect("session builds");

        wait_for(|| authenticator.source().fetches.load(Ordering::SeqCst) >= 3).await;
        assert!(session.is_refreshing().await, "loop survives failed refreshes");
        session.dispose().await;
        assert!(!session.is_refreshing().await);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn expired_credentials_start_no_loop() {
        let authenticator = token_authenticator(false, Duration::ZERO);
        let session = Session::builder(
            echo_auth_transport(),
            Authenticator::Refreshable(authenticator),
        )
        .build()
        .expect("session builds");
        assert!(!session.is_refreshing().await);
    }

    #[test]
    fn refresh_loop_requires_a_runtime() {
        let authenticator = token_authenticator(false, Duration::from_secs(600));
        let error = Session::builder(
            echo_auth_transport(),
            Authenticator::Refreshable(authenticator),
        )
        .build()
        .expect_err("no runtime to host the loop");
        assert_eq!(error.code(), ErrorCode::RuntimeUnavailable);
    }
}
