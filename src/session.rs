use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::lock::{LockError, ParkingLotRawLock, RawLock, SessionLock, SessionLockGuard};
use crate::registry::{Connector, ConnectorRegistry, RegistryError};
use crate::sequencer::SyncId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("timed out after {0:?} waiting for the session lock")]
    LockTimeout(Duration),
    #[error("session state is already borrowed further up this thread's stack")]
    StateBorrowed,
    #[error("acknowledged sync id {acknowledged} has not completed (current {current})")]
    AckAhead { acknowledged: SyncId, current: SyncId },
}

/// Result of one completed round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTrip<T> {
    pub value: T,
    /// Id of the round-trip that just completed. The client acknowledges
    /// this value once it has applied the response.
    pub sync_id: SyncId,
}

/// One UI session: its lock and the connector state it protects.
///
/// The registry is reachable only through a [`SessionGuard`], so every
/// read or mutation happens with the session lock held. The inner mutex is
/// never contended across threads (the session lock already excludes
/// them); it only turns a nested borrow on the same thread into
/// [`SessionError::StateBorrowed`] instead of aliasing.
pub struct Session<C: Connector + ?Sized, R: RawLock = ParkingLotRawLock> {
    lock: SessionLock<R>,
    state: Mutex<ConnectorRegistry<C>>,
    config: SessionConfig,
}

impl<C: Connector + ?Sized> Session<C> {
    pub fn new(config: SessionConfig) -> Self {
        let raw = ParkingLotRawLock::with_poll_interval(config.cancel_poll_interval());
        Self::with_raw_lock(raw, config)
    }
}

impl<C: Connector + ?Sized> Default for Session<C> {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl<C: Connector + ?Sized, R: RawLock> Session<C, R> {
    /// Build a session over a caller-supplied lock primitive.
    pub fn with_raw_lock(raw: R, config: SessionConfig) -> Self {
        Self {
            lock: SessionLock::with_raw(raw),
            state: Mutex::new(ConnectorRegistry::with_page_size(config.journal_page_size)),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying session lock, for diagnostics and explicit
    /// acquire/release pairs.
    pub fn session_lock(&self) -> &SessionLock<R> {
        &self.lock
    }

    /// Block until this thread holds the session.
    pub fn lock(&self) -> SessionGuard<'_, C, R> {
        SessionGuard::new(self, self.lock.lock())
    }

    /// Block until this thread holds the session or `cancel` fires.
    pub fn lock_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SessionGuard<'_, C, R>, SessionError> {
        let guard = self.lock.lock_cancellable(cancel)?;
        Ok(SessionGuard::new(self, guard))
    }

    pub fn try_lock(&self) -> Option<SessionGuard<'_, C, R>> {
        self.lock
            .try_lock()
            .map(|guard| SessionGuard::new(self, guard))
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<SessionGuard<'_, C, R>> {
        self.lock
            .try_lock_for(timeout)
            .map(|guard| SessionGuard::new(self, guard))
    }

    /// Run `f` against the registry with the session held.
    pub fn with_state<T>(
        &self,
        f: impl FnOnce(&mut ConnectorRegistry<C>) -> T,
    ) -> Result<T, SessionError> {
        let guard = self.lock();
        let mut state = guard.state()?;
        Ok(f(&mut state))
    }

    /// Process one request/response round-trip.
    ///
    /// Holds the session lock throughout. `acknowledged` is the latest sync
    /// id the client has confirmed; ids journaled up to it are purged before
    /// `f` runs. The sequencer advances only if `f` succeeds, and the lock is
    /// released on every exit path.
    ///
    /// The purge stands even when `f` fails. An acknowledgement of an
    /// unfinished round-trip is rejected up front with nothing changed.
    pub fn round_trip<T, F>(
        &self,
        acknowledged: Option<SyncId>,
        f: F,
    ) -> Result<RoundTrip<T>, SessionError>
    where
        F: FnOnce(&mut ConnectorRegistry<C>) -> Result<T, SessionError>,
    {
        let started = Instant::now();
        let guard = self.lock_for_request()?;
        let mut state = guard.state()?;

        let current = state.sync_id();
        if let Some(acknowledged) = acknowledged {
            if acknowledged >= current {
                tracing::warn!(acknowledged, current, "client acknowledged an unfinished round-trip");
                return Err(SessionError::AckAhead {
                    acknowledged,
                    current,
                });
            }
            state.cleanup(acknowledged);
        }

        let value = f(&mut state)?;
        state.advance_sync_id();
        tracing::debug!(
            sync_id = current,
            connectors = state.len(),
            journaled = state.journal().len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "round-trip complete"
        );
        Ok(RoundTrip {
            value,
            sync_id: current,
        })
    }

    fn lock_for_request(&self) -> Result<SessionGuard<'_, C, R>, SessionError> {
        match self.config.request_lock_timeout() {
            Some(timeout) => self
                .try_lock_for(timeout)
                .ok_or(SessionError::LockTimeout(timeout)),
            None => Ok(self.lock()),
        }
    }
}

impl<C: Connector + ?Sized, R: RawLock> std::fmt::Debug for Session<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lock", &self.lock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Proof that the current thread holds a [`Session`].
pub struct SessionGuard<'a, C: Connector + ?Sized, R: RawLock = ParkingLotRawLock> {
    session: &'a Session<C, R>,
    _lock: SessionLockGuard<'a, R>,
}

impl<'a, C: Connector + ?Sized, R: RawLock> SessionGuard<'a, C, R> {
    fn new(session: &'a Session<C, R>, lock: SessionLockGuard<'a, R>) -> Self {
        Self {
            session,
            _lock: lock,
        }
    }

    /// Borrow the session's registry.
    ///
    /// Fails with [`SessionError::StateBorrowed`] if an outer frame on this
    /// thread already has it; reentrant lock holders must pass the borrow
    /// down instead of taking a second one.
    pub fn state(&self) -> Result<MutexGuard<'_, ConnectorRegistry<C>>, SessionError> {
        self.session
            .state
            .try_lock()
            .ok_or(SessionError::StateBorrowed)
    }

    pub fn hold_count(&self) -> usize {
        self.session.lock.hold_count()
    }
}
