use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Sends one fully-buffered HTTP request.
///
/// Implementations report network failures as [`crate::Error::Transport`]
/// and return non-success statuses as ordinary responses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: Request<Bytes>,
        cancel: CancellationToken,
    ) -> Result<Response<Bytes>>;
}

/// Adapts an async closure into a [`Transport`].
#[derive(Clone, Debug)]
pub struct FnTransport<F>(F);

pub fn transport_fn<F, Fut>(send: F) -> FnTransport<F>
where
    F: Fn(Request<Bytes>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Bytes>>> + Send + 'static,
{
    FnTransport(send)
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Request<Bytes>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Bytes>>> + Send + 'static,
{
    async fn send(
        &self,
        request: Request<Bytes>,
        cancel: CancellationToken,
    ) -> Result<Response<Bytes>> {
        (self.0)(request, cancel).await
    }
}

/// `http::Request` is not `Clone`; every attempt gets its own copy.
pub(crate) fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut cloned = Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.version_mut() = request.version();
    *cloned.headers_mut() = request.headers().clone();
    *cloned.extensions_mut() = request.extensions().clone();
    cloned
}
