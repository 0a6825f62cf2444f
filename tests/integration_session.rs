use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use http::header::AUTHORIZATION;
use http::{Request, Response, StatusCode};
use sessionx::prelude::{
    Authenticator, Backoff, ErrorCode, ErrorKind, PolicyRunner, RegistryConfig, RetryPolicy,
    Session, SessionId, SessionRegistry, TokenAuthenticator, Transport, transport_fn,
};
use sessionx::{IssuedToken, Observer, RefreshSchedule, TokenSource};
use tokio_util::sync::CancellationToken;

struct CountingIssuer {
    fetches: AtomicUsize,
    lifetime: Duration,
}

impl CountingIssuer {
    fn new(lifetime: Duration) -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            lifetime,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for CountingIssuer {
    async fn fetch(&self, _cancel: &CancellationToken) -> sessionx::Result<IssuedToken> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(IssuedToken::new(
            format!("issued-{fetch}"),
            SystemTime::now() + self.lifetime,
        ))
    }
}

fn ok_transport() -> Arc<dyn Transport> {
    Arc::new(transport_fn(|_request, _cancel| async {
        Ok(Response::new(Bytes::new()))
    }))
}

#[derive(Default)]
struct RecordingObserver {
    refreshed: AtomicUsize,
    disposed: AtomicUsize,
    swept: AtomicUsize,
}

impl Observer for RecordingObserver {
    fn on_refresh_succeeded(&self, _session: SessionId, _expires_at: SystemTime) {
        self.refreshed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_session_disposed(&self, _session: SessionId) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sessions_swept(&self, removed: usize) {
        self.swept.fetch_add(removed, Ordering::SeqCst);
    }
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within two seconds");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_reach_the_issuer_once() {
    let authenticator = Arc::new(TokenAuthenticator::new(CountingIssuer::new(
        Duration::from_secs(600),
    )));
    let session = Session::builder(
        ok_transport(),
        Authenticator::Refreshable(authenticator.clone()),
    )
    .build()
    .expect("session builds");

    let cancel = CancellationToken::new();
    let results = join_all((0..50).map(|_| session.refresh_credentials(&cancel))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(authenticator.source().fetches(), 1);
    session.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disposal_stops_the_refresh_loop() {
    let issuer_lifetime = Duration::from_millis(80);
    let authenticator = Arc::new(
        TokenAuthenticator::with_token(
            CountingIssuer::new(issuer_lifetime),
            IssuedToken::new("seed", SystemTime::now() + Duration::from_millis(50)),
        )
        .expect("valid seed token")
        .skip_margin(Duration::from_millis(40)),
    );
    let observer = Arc::new(RecordingObserver::default());
    let session = Session::builder(
        ok_transport(),
        Authenticator::Refreshable(authenticator.clone()),
    )
    .refresh_schedule(
        RefreshSchedule::standard()
            .refresh_margin(Duration::from_millis(40))
            .min_interval(Duration::from_millis(10)),
    )
    .observer(observer.clone())
    .build()
    .expect("session builds");

    eventually(|| observer.refreshed.load(Ordering::SeqCst) >= 2).await;

    tokio::time::timeout(Duration::from_secs(1), session.dispose())
        .await
        .expect("disposal completes promptly");
    assert!(!session.is_refreshing().await);
    assert_eq!(observer.disposed.load(Ordering::SeqCst), 1);

    let fetches = authenticator.source().fetches();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(authenticator.source().fetches(), fetches, "no refresh after disposal");
}

#[tokio::test(flavor = "current_thread")]
async fn session_requests_retry_transient_statuses() {
    let sends = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&sends);
    let transport: Arc<dyn Transport> = Arc::new(transport_fn(
        move |request: Request<Bytes>, _cancel| {
            let send = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                assert!(request.headers().contains_key(AUTHORIZATION));
                let mut response = Response::new(Bytes::from_static(b"done"));
                if send == 0 {
                    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                }
                Ok(response)
            }
        },
    ));
    let runner = PolicyRunner::builder()
        .retry(
            RetryPolicy::standard_http()
                .backoff(Backoff::Fixed)
                .base_delay(Duration::from_millis(1)),
        )
        .build()
        .expect("valid pipeline");

    let authenticator = Arc::new(TokenAuthenticator::new(CountingIssuer::new(
        Duration::from_secs(600),
    )));
    let session = Session::builder(transport, Authenticator::Refreshable(authenticator.clone()))
        .policy_runner(runner)
        .build()
        .expect("session builds");

    let request = Request::post("https://api.example.com/v1/items")
        .body(Bytes::from_static(b"{}"))
        .expect("valid request");
    let response = session
        .execute(request, CancellationToken::new())
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sends.load(Ordering::SeqCst), 2);
    assert_eq!(authenticator.source().fetches(), 1, "authenticated once per call");

    let metrics = session.metrics_snapshot();
    assert_eq!(metrics.executions_succeeded, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn cancelled_session_request_reports_cancellation() {
    let transport: Arc<dyn Transport> = Arc::new(transport_fn(
        |_request, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err(sessionx::Error::Cancelled)
        },
    ));
    let session = Session::builder(transport, Authenticator::none())
        .policy_runner(
            PolicyRunner::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("valid pipeline"),
        )
        .build()
        .expect("session builds");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let error = session
        .execute(Request::new(Bytes::new()), cancel)
        .await
        .expect_err("caller cancelled");
    assert_eq!(error.kind(), ErrorKind::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registry_tracks_and_reclaims_sessions() {
    let observer = Arc::new(RecordingObserver::default());
    let registry = SessionRegistry::with_observer(
        RegistryConfig::standard()
            .sweep_interval(Duration::from_millis(20))
            .idle_timeout(Duration::from_millis(100)),
        observer.clone(),
    )
    .expect("registry starts");

    let id = SessionId::random();
    let session = registry
        .create(Session::builder(ok_transport(), Authenticator::none()).id(id))
        .await
        .expect("session registered");
    let collision = registry
        .create(Session::builder(ok_transport(), Authenticator::none()).id(id))
        .await
        .expect_err("identity collision");
    assert_eq!(collision.code(), ErrorCode::DuplicateSession);
    assert_eq!(collision.kind(), ErrorKind::InvariantViolation);

    let before = session.last_used_at();
    let found = registry.get(id).expect("session present");
    assert!(found.last_used_at() >= before);
    assert!(registry.get(SessionId::random()).is_none());

    eventually(|| session.is_disposed()).await;
    eventually(|| registry.is_empty()).await;
    assert!(observer.swept.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registry_disposal_tears_down_refreshing_sessions() {
    let registry = SessionRegistry::new(RegistryConfig::standard()).expect("registry starts");
    let mut sessions = Vec::new();
    for _ in 0..10 {
        let authenticator = TokenAuthenticator::with_token(
            CountingIssuer::new(Duration::from_secs(600)),
            IssuedToken::new("seed", SystemTime::now() + Duration::from_secs(600)),
        )
        .expect("valid seed token");
        let session = registry
            .create(Session::builder(
                ok_transport(),
                Authenticator::refreshable(authenticator),
            ))
            .await
            .expect("session registered");
        assert!(session.is_refreshing().await);
        sessions.push(session);
    }
    assert_eq!(registry.len(), 10);

    tokio::time::timeout(Duration::from_secs(2), registry.dispose())
        .await
        .expect("registry drains promptly");
    assert!(registry.is_empty());
    for session in &sessions {
        assert!(session.is_disposed());
        assert!(!session.is_refreshing().await);
    }

    let error = sessions[0]
        .execute(Request::new(Bytes::new()), CancellationToken::new())
        .await
        .expect_err("disposed sessions refuse work");
    assert_eq!(error.code(), ErrorCode::SessionDisposed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registry_operations_hold_under_concurrent_callers() {
    let registry = Arc::new(
        SessionRegistry::new(
            RegistryConfig::standard()
                .sweep_interval(Duration::from_millis(1))
                .idle_timeout(Duration::from_secs(600)),
        )
        .expect("registry starts"),
    );

    let tasks = (0..64_u128).map(|task| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let id = SessionId::from_u128(task % 8 + 1).expect("non-zero id");
            let session = registry
                .create(Session::builder(ok_transport(), Authenticator::none()).id(id))
                .await
                .ok()?;
            assert!(registry.get(id).is_some());
            registry.sweep().await;
            if task % 2 == 0 {
                assert!(registry.remove(id));
                Some((session, true))
            } else {
                Some((session, false))
            }
        })
    });
    let created: Vec<(Arc<Session>, bool)> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|outcome| outcome.expect("task completes"))
        .collect();

    let (removed, kept): (Vec<_>, Vec<_>) = created.into_iter().partition(|(_, removed)| *removed);
    for id in 1..=8 {
        let holders = kept.iter().filter(|(session, _)| session.id().as_u128() == id).count();
        assert!(holders <= 1, "identity {id} tracked twice");
    }
    assert_eq!(registry.len(), kept.len());
    for (session, _) in &removed {
        assert!(!session.is_disposed());
        session.dispose().await;
    }
    assert_eq!(registry.len(), kept.len(), "removed sessions were unsubscribed");

    let creators = (0..32).map(|_| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            registry
                .create(Session::builder(ok_transport(), Authenticator::none()))
                .await
        })
    });
    let disposer = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.dispose().await })
    };
    let outcomes = join_all(creators).await;
    disposer.await.expect("disposal completes");

    for outcome in outcomes {
        match outcome.expect("task completes") {
            Ok(session) => assert!(session.is_disposed(), "live session left after disposal"),
            Err(error) => assert_eq!(error.code(), ErrorCode::RegistryDisposed),
        }
    }
    for (session, _) in &kept {
        assert!(session.is_disposed());
    }
    assert!(registry.is_empty());
}
