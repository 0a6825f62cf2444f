//! `sessionx` runs HTTP work through composable resilience policies and
//! manages authenticated sessions around them.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use sessionx::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport: Arc<dyn Transport> = Arc::new(transport_fn(|_request, _cancel| async {
//!         Ok(Response::new(Bytes::from_static(b"ok")))
//!     }));
//!
//!     let runner = PolicyRunner::builder()
//!         .rate_limiter(RateLimiterPolicy::new(TokenBucketConfig::new(20, 10.0))?)
//!         .timeout(Duration::from_secs(8))
//!         .retry(RetryPolicy::standard_http())
//!         .circuit_breaker(CircuitBreakerPolicy::standard())
//!         .attempt_timeout(Duration::from_secs(3))
//!         .build()?;
//!
//!     let registry = SessionRegistry::new(RegistryConfig::standard())?;
//!     let session = registry
//!         .create(
//!             Session::builder(transport, Authenticator::plain(HeaderAuthenticator::bearer("t")?))
//!                 .policy_runner(runner),
//!         )
//!         .await?;
//!
//!     let request = Request::get("https://api.example.com/v1/items").body(Bytes::new())?;
//!     let response = session.execute(request, CancellationToken::new()).await?;
//!     println!("status={}", response.status());
//!
//!     registry.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! # Pipeline Order
//!
//! A [`PolicyRunner`] always nests its layers the same way, outermost first:
//! rate limiter, total timeout, retry, circuit breaker, per-attempt timeout.
//! Every attempt passes through the breaker; a single permit covers all
//! retries; the total timeout bounds retry delays too.

mod auth;
mod circuit;
mod core;
mod policy;
mod profile;
mod rate_limit;
mod registry;
mod retry;
mod runner;
mod session;
mod timeout;
mod transport;

pub(crate) use crate::core::{error, metrics, observe, util};

pub use crate::auth::{
    Authenticator, HeaderAuthenticator, IssuedToken, NoAuthenticator, RefreshableAuthenticator,
    RequestAuthenticator, TokenAuthenticator, TokenSource,
};
pub use crate::circuit::{
    CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState, HandledErrorPredicate,
};
#[cfg(feature = "otel")]
pub use crate::core::otel::OtelObserver;
pub use crate::error::{Error, ErrorCode, ErrorKind};
pub use crate::metrics::RunnerMetricsSnapshot;
pub use crate::observe::{NoopObserver, Observer};
pub use crate::policy::{NoOpPolicy, Operation, ResiliencePolicy, operation};
pub use crate::profile::{
    MachineCapability, MachineProbe, MachineProfileAdvisor, ProfileDefaults, RateLimiterOptions,
    RateLimiterProfile, StaticMachineProbe, SystemMachineProbe,
};
pub use crate::rate_limit::{
    FixedWindowConfig, QueueOrder, RateLimiterConfig, RateLimiterKind, RateLimiterPolicy,
    RateLimiterResolver, RateLimiterRouter, RequestContext, SlidingWindowConfig,
    TokenBucketConfig,
};
pub use crate::registry::{RegistryConfig, SessionRegistry};
pub use crate::retry::{Backoff, RetryDecision, RetryPolicy, RetryPredicate};
pub use crate::runner::{PolicyRunner, PolicyRunnerBuilder};
pub use crate::session::{
    DisposeSubscription, ParseSessionIdError, RefreshSchedule, Session, SessionBuilder, SessionId,
};
pub use crate::timeout::{TimeoutPolicy, TimeoutScope};
pub use crate::transport::{FnTransport, Transport, transport_fn};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Authenticator, Backoff, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState, Error,
        ErrorCode, ErrorKind, FixedWindowConfig, HeaderAuthenticator, MachineProfileAdvisor,
        Observer, PolicyRunner, RateLimiterConfig, RateLimiterKind, RateLimiterOptions,
        RateLimiterPolicy, RateLimiterRouter, RegistryConfig, RequestContext, ResiliencePolicy,
        RetryPolicy, Session, SessionId, SessionRegistry, SlidingWindowConfig, TimeoutPolicy,
        TokenAuthenticator, TokenBucketConfig, Transport, operation, transport_fn,
    };
}
