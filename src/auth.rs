use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderName};
use http::{HeaderValue, Request};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::error::Error;
use crate::util::lock_unpoisoned;

/// Stamps credentials onto an outgoing request.
#[async_trait]
pub trait RequestAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        request: &mut Request<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Authenticator whose credential expires and can be renewed.
///
/// `refresh` must be single-flight: concurrent callers may all invoke it, but
/// at most one renewal reaches the credential issuer at a time.
#[async_trait]
pub trait RefreshableAuthenticator: RequestAuthenticator {
    fn expires_at(&self) -> SystemTime;

    async fn is_valid(&self, cancel: &CancellationToken) -> Result<bool>;

    async fn refresh(&self, cancel: &CancellationToken) -> Result<()>;
}

/// The authenticator handle a session owns.
#[derive(Clone)]
pub enum Authenticator {
    Plain(Arc<dyn RequestAuthenticator>),
    Refreshable(Arc<dyn RefreshableAuthenticator>),
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "Plain",
            Self::Refreshable(_) => "Refreshable",
        };
        formatter.debug_tuple("Authenticator").field(&kind).finish()
    }
}

impl Authenticator {
    pub fn none() -> Self {
        Self::Plain(Arc::new(NoAuthenticator))
    }

    pub fn plain(authenticator: impl RequestAuthenticator + 'static) -> Self {
        Self::Plain(Arc::new(authenticator))
    }

    pub fn refreshable(authenticator: impl RefreshableAuthenticator + 'static) -> Self {
        Self::Refreshable(Arc::new(authenticator))
    }

    pub async fn authenticate(
        &self,
        request: &mut Request<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            Self::Plain(authenticator) => authenticator.authenticate(request, cancel).await,
            Self::Refreshable(authenticator) => authenticator.authenticate(request, cancel).await,
        }
    }

    pub fn as_refreshable(&self) -> Option<&Arc<dyn RefreshableAuthenticator>> {
        match self {
            Self::Plain(_) => None,
            Self::Refreshable(authenticator) => Some(authenticator),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuthenticator;

#[async_trait]
impl RequestAuthenticator for NoAuthenticator {
    async fn authenticate(
        &self,
        _request: &mut Request<Bytes>,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}

/// Sets one fixed header, e.g. an API key or a precomputed basic credential.
#[derive(Clone, Debug)]
pub struct HeaderAuthenticator {
    name: HeaderName,
    value: HeaderValue,
}

impl HeaderAuthenticator {
    pub fn new(name: HeaderName, mut value: HeaderValue) -> Self {
        value.set_sensitive(true);
        Self { name, value }
    }

    pub fn bearer(token: &str) -> Result<Self> {
        Ok(Self::new(AUTHORIZATION, bearer_header(token)?))
    }
}

#[async_trait]
impl RequestAuthenticator for HeaderAuthenticator {
    async fn authenticate(
        &self,
        request: &mut Request<Bytes>,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        request
            .headers_mut()
            .insert(self.name.clone(), self.value.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_at: SystemTime,
}

impl IssuedToken {
    pub fn new(access_token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("IssuedToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues access tokens, e.g. an OAuth2 token endpoint.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<IssuedToken>;
}

#[derive(Debug)]
struct TokenState {
    header: Option<HeaderValue>,
    expires_at: SystemTime,
}

/// Bearer-token authenticator with single-flight refresh.
///
/// The current token and expiry are only written while the refresh lock is
/// held. A refresh that acquires the lock after another caller already
/// renewed the token past `skip_margin` returns without fetching.
/// `authenticate` refreshes just in time when the token is within
/// `refresh_margin` of expiry.
pub struct TokenAuthenticator<S> {
    source: S,
    state: Mutex<TokenState>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_margin: Duration,
    skip_margin: Duration,
}

impl<S> std::fmt::Debug for TokenAuthenticator<S> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TokenAuthenticator")
            .field("expires_at", &lock_unpoisoned(&self.state).expires_at)
            .field("refresh_margin", &self.refresh_margin)
            .field("skip_margin", &self.skip_margin)
            .finish_non_exhaustive()
    }
}

impl<S: TokenSource> TokenAuthenticator<S> {
    /// Starts without a token; the first request fetches one.
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: Mutex::new(TokenState {
                header: None,
                expires_at: UNIX_EPOCH,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_margin: Duration::from_secs(60),
            skip_margin: Duration::from_secs(120),
        }
    }

    pub fn with_token(source: S, token: IssuedToken) -> Result<Self> {
        let authenticator = Self::new(source);
        authenticator.store(&token)?;
        Ok(authenticator)
    }

    pub fn refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    pub fn skip_margin(mut self, skip_margin: Duration) -> Self {
        self.skip_margin = skip_margin;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn store(&self, token: &IssuedToken) -> Result<()> {
        let header = bearer_header(&token.access_token)?;
        let mut state = lock_unpoisoned(&self.state);
        state.header = Some(header);
        state.expires_at = token.expires_at;
        Ok(())
    }

    fn expires_within(&self, margin: Duration) -> bool {
        let state = lock_unpoisoned(&self.state);
        state.header.is_none()
            || SystemTime::now()
                .checked_add(margin)
                .is_none_or(|threshold| state.expires_at <= threshold)
    }
}

#[async_trait]
impl<S: TokenSource> RequestAuthenticator for TokenAuthenticator<S> {
    async fn authenticate(
        &self,
        request: &mut Request<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.expires_within(self.refresh_margin) {
            self.refresh(cancel).await?;
        }
        let header = lock_unpoisoned(&self.state)
            .header
            .clone()
            .ok_or_else(|| Error::authentication("no access token available"))?;
        request.headers_mut().insert(AUTHORIZATION, header);
        Ok(())
    }
}

#[async_trait]
impl<S: TokenSource> RefreshableAuthenticator for TokenAuthenticator<S> {
    fn expires_at(&self) -> SystemTime {
        lock_unpoisoned(&self.state).expires_at
    }

    async fn is_valid(&self, _cancel: &CancellationToken) -> Result<bool> {
        let state = lock_unpoisoned(&self.state);
        Ok(state.header.is_some() && state.expires_at > SystemTime::now())
    }

    async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let _refreshing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.refresh_lock.lock() => guard,
        };

        if !self.expires_within(self.skip_margin) {
            debug!("token already refreshed by a concurrent caller");
            return Ok(());
        }

        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            token = self.source.fetch(cancel) => token?,
        };
        self.store(&token)?;
        debug!("access token refreshed");
        Ok(())
    }
}

fn bearer_header(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(Error::authentication)?;
    value.set_sensitive(true);
    Ok(value)
}
