//! Concurrent registry of live sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::error::{Error, invalid_config};
use crate::observe::{Observer, noop_observer};
use crate::session::{DisposeSubscription, Session, SessionBuilder, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    sweep_interval: Duration,
    idle_timeout: Option<Duration>,
}

impl RegistryConfig {
    pub const fn standard() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            idle_timeout: None,
        }
    }

    pub const fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Sweeps also dispose sessions unused for longer than this.
    pub const fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub const fn configured_sweep_interval(self) -> Duration {
        self.sweep_interval
    }

    pub const fn configured_idle_timeout(self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn validate(self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(invalid_config("registry", "sweep_interval must be non-zero"));
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::standard()
    }
}

struct Tracked {
    session: Arc<Session>,
    subscription: DisposeSubscription,
}

struct Shared {
    sessions: DashMap<SessionId, Tracked>,
    disposed: AtomicBool,
    idle_timeout: Option<Duration>,
    observer: Arc<dyn Observer>,
}

impl Shared {
    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(&entry.value().session))
            .collect()
    }

    fn evict_disposed(&self, id: SessionId) -> bool {
        self.sessions
            .remove_if(&id, |_, tracked| tracked.session.is_disposed())
            .is_some()
    }

    async fn sweep(&self) -> usize {
        let disposed: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().session.is_disposed())
            .map(|entry| *entry.key())
            .collect();
        let mut removed = disposed
            .into_iter()
            .filter(|id| self.evict_disposed(*id))
            .count();

        if let Some(idle_timeout) = self.idle_timeout {
            let threshold = SystemTime::now()
                .checked_sub(idle_timeout)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let idle: Vec<SessionId> = self
                .sessions
                .iter()
                .filter(|entry| entry.value().session.last_used_at() <= threshold)
                .map(|entry| *entry.key())
                .collect();
            for id in idle {
                // Sessions removed or touched since the scan stay with their caller.
                let Some((_, tracked)) = self.sessions.remove_if(&id, |_, tracked| {
                    tracked.session.last_used_at() <= threshold
                }) else {
                    continue;
                };
                tracked.session.unsubscribe_disposed(tracked.subscription);
                tracked.session.dispose().await;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, remaining = self.sessions.len(), "swept sessions");
        }
        self.observer.on_sessions_swept(removed);
        removed
    }
}

/// Tracks sessions by identity and reclaims disposed or idle ones.
///
/// Sessions unregister themselves when disposed. A periodic sweep also
/// evicts any disposed session still present and, with an idle timeout,
/// disposes sessions that have not been used recently.
pub struct SessionRegistry {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    sweeper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionRegistry")
            .field("sessions", &self.shared.sessions.len())
            .field("disposed", &self.shared.disposed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Starts the sweep timer on the current tokio runtime.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_observer(config, noop_observer())
    }

    pub fn with_observer(config: RegistryConfig, observer: Arc<dyn Observer>) -> Result<Self> {
        config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeUnavailable {
                component: "session registry sweeper",
            })?;

        let shared = Arc::new(Shared {
            sessions: DashMap::new(),
            disposed: AtomicBool::new(false),
            idle_timeout: config.idle_timeout,
            observer,
        });
        let shutdown = CancellationToken::new();
        let sweeper = runtime.spawn(sweep_loop(
            Arc::downgrade(&shared),
            config.sweep_interval,
            shutdown.clone(),
        ));

        Ok(Self {
            shared,
            shutdown,
            sweeper: tokio::sync::Mutex::new(Some(sweeper)),
        })
    }

    /// Builds a session from `builder` and tracks it.
    ///
    /// An identity already present is an invariant violation: the new
    /// session is disposed and [`Error::DuplicateSession`] is returned.
    pub async fn create(&self, builder: SessionBuilder) -> Result<Arc<Session>> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(Error::RegistryDisposed);
        }
        if let Some(id) = builder.configured_id()
            && self.shared.sessions.contains_key(&id)
        {
            return Err(Error::DuplicateSession { id });
        }

        let session = builder.build()?;
        let id = session.id();
        let inserted = match self.shared.sessions.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let registry = Arc::downgrade(&self.shared);
                let subscription = session.subscribe_disposed(move |id| {
                    if let Some(registry) = registry.upgrade() {
                        registry.evict_disposed(id);
                    }
                });
                vacant.insert(Tracked {
                    session: Arc::clone(&session),
                    subscription,
                });
                true
            }
        };

        if !inserted {
            session.dispose().await;
            return Err(Error::DuplicateSession { id });
        }
        // Pairs with the store in `dispose`: either its snapshot sees this
        // entry or this load sees the flag.
        if self.shared.disposed.load(Ordering::SeqCst) {
            if let Some((_, tracked)) = self
                .shared
                .sessions
                .remove_if(&id, |_, tracked| Arc::ptr_eq(&tracked.session, &session))
            {
                session.unsubscribe_disposed(tracked.subscription);
            }
            session.dispose().await;
            return Err(Error::RegistryDisposed);
        }
        debug!(session = %id, "session registered");
        Ok(session)
    }

    /// Looks up a session and records the lookup as use.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        let session = self
            .shared
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(&entry.value().session))?;
        session.touch();
        Some(session)
    }

    /// Stops tracking `id` without disposing it.
    pub fn remove(&self, id: SessionId) -> bool {
        match self.shared.sessions.remove(&id) {
            Some((_, tracked)) => {
                tracked.session.unsubscribe_disposed(tracked.subscription);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.shared.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.sessions.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.shared.snapshot()
    }

    /// Least recently used first.
    pub fn by_last_used(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.shared.snapshot();
        sessions.sort_by_key(|session| session.last_used_at());
        sessions
    }

    /// Sessions last used at or before `threshold`.
    pub fn idle_since(&self, threshold: SystemTime) -> Vec<Arc<Session>> {
        self.shared
            .snapshot()
            .into_iter()
            .filter(|session| session.last_used_at() <= threshold)
            .collect()
    }

    /// Runs one sweep now and returns how many sessions it removed.
    pub async fn sweep(&self) -> usize {
        self.shared.sweep().await
    }

    /// Stops the sweep timer, disposes every tracked session and empties
    /// the registry. Later `create` calls fail with
    /// [`Error::RegistryDisposed`].
    pub async fn dispose(&self) {
        let mut sweeper = self.sweeper.lock().await;
        self.shared.disposed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(task) = sweeper.take()
            && let Err(error) = task.await
        {
            warn!(error = %error, "session sweep task panicked");
        }

        let sessions = self.shared.snapshot();
        let count = sessions.len();
        join_all(sessions.iter().map(|session| session.dispose())).await;
        self.shared.sessions.clear();
        debug!(sessions = count, "session registry disposed");
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sweep_loop(shared: Weak<Shared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        // A panicking listener must not end the timer.
        let tick = tokio::spawn(async move {
            shared.sweep().await;
        });
        if let Err(error) = tick.await {
            warn!(error = %error, "session sweep failed");
        }
    }
    debug!("session sweep loop stopped");
}
