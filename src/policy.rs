//! The policy capability every resilience layer implements.
//!
//! An [`Operation`] is a re-invocable unit of asynchronous work that receives
//! the cancellation token of the attempt it runs in. Policies wrap an
//! operation, may delay, reject or repeat it, and return its result.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Deferred work parameterized by a cancellation token.
///
/// Retries call the same operation again, so it is `Fn` rather than `FnOnce`.
pub type Operation<T> = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Builds an [`Operation`] from an async closure.
pub fn operation<T, F, Fut>(work: F) -> Operation<T>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move |cancel| work(cancel).boxed())
}

pub trait ResiliencePolicy<T>: Send + Sync {
    /// Runs `operation` under this policy.
    ///
    /// `cancel` is the caller's token. Implementations hand the operation
    /// either this token or a child of it, never an unrelated one.
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>>;
}

impl<T, P> ResiliencePolicy<T> for Arc<P>
where
    P: ResiliencePolicy<T> + ?Sized,
{
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>> {
        (**self).execute(operation, cancel)
    }
}

/// Transparent pass-through used for every empty pipeline slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpPolicy;

impl<T: Send + 'static> ResiliencePolicy<T> for NoOpPolicy {
    fn execute(
        &self,
        operation: Operation<T>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<T>> {
        operation(cancel)
    }
}
