//! Reentrant session lock.
//!
//! [`SessionLock`] layers per-thread ownership and a hold count over any
//! primitive implementing [`RawLock`]. The primitive only ever sees one
//! `lock`/`unlock` pair per outermost acquisition; nested acquisitions by the
//! owning thread are counted here and never reach it.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("session lock released by a thread that does not hold it")]
    NotOwner,
    #[error("session lock acquisition was cancelled")]
    Cancelled,
    #[error("conditions are not supported by the session lock")]
    ConditionsUnsupported,
}

/// Condition variable type for [`SessionLock::new_condition`].
///
/// Uninhabited: no value of this type can be constructed.
#[derive(Debug)]
pub enum Condition {}

/// The mutual-exclusion primitive wrapped by a [`SessionLock`].
///
/// Implementations need not be reentrant. `unlock` is only ever called by
/// the thread that currently holds the primitive.
pub trait RawLock: Send + Sync {
    /// Block until the lock is acquired.
    fn lock(&self);

    /// Block until the lock is acquired or `cancel` fires.
    ///
    /// On cancellation the lock must not be held by the caller.
    fn lock_cancellable(&self, cancel: &CancellationToken) -> Result<(), LockError>;

    /// Acquire the lock only if it is free right now.
    fn try_lock(&self) -> bool;

    /// Acquire the lock, waiting at most `timeout`.
    fn try_lock_for(&self, timeout: Duration) -> bool;

    /// Release the lock.
    fn unlock(&self);
}

/// Default interval at which a cancellable wait re-checks its token.
pub const DEFAULT_CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Non-reentrant lock built from a `parking_lot` mutex and condvar.
///
/// Unlike a plain mutex guard, the held state is not tied to a stack frame,
/// so the lock can be released from a different call than the one that took
/// it.
pub struct ParkingLotRawLock {
    locked: Mutex<bool>,
    released: Condvar,
    poll_interval: Duration,
}

impl ParkingLotRawLock {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_CANCEL_POLL_INTERVAL)
    }

    /// Create a lock whose cancellable waits wake at least every `interval`
    /// to check for cancellation.
    pub fn with_poll_interval(interval: Duration) -> Self {
        Self {
            locked: Mutex::new(false),
            released: Condvar::new(),
            poll_interval: interval.max(Duration::from_millis(1)),
        }
    }
}

impl Default for ParkingLotRawLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for ParkingLotRawLock {
    fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
    }

    fn lock_cancellable(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        let mut locked = self.locked.lock();
        loop {
            if cancel.is_cancelled() {
                // This waiter may have consumed the wakeup from `unlock`.
                if !*locked {
                    self.released.notify_one();
                }
                return Err(LockError::Cancelled);
            }
            if !*locked {
                *locked = true;
                return Ok(());
            }
            let _ = self.released.wait_for(&mut locked, self.poll_interval);
        }
    }

    fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock();
        if *locked {
            return false;
        }
        *locked = true;
        true
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut locked = self.locked.lock();
        while *locked {
            if self.released.wait_until(&mut locked, deadline).timed_out() && *locked {
                return false;
            }
        }
        *locked = true;
        true
    }

    fn unlock(&self) {
        *self.locked.lock() = false;
        self.released.notify_one();
    }
}

const NO_OWNER: u32 = 0;
const HOLDS_MASK: u64 = u32::MAX as u64;

/// Process-unique, non-zero token for the calling thread.
///
/// `ThreadId::as_u64()` is nightly-only, so tokens are handed out from a
/// counter the first time a thread asks.
fn current_thread_token() -> u32 {
    static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static TOKEN: u32 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

/// Owner token in the high half, hold count in the low half.
fn pack(owner: u32, holds: u32) -> u64 {
    (u64::from(owner) << 32) | u64::from(holds)
}

fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, (state & HOLDS_MASK) as u32)
}

/// Reentrant mutual exclusion for one session's state.
///
/// The owning thread may acquire the lock any number of times; it stays held
/// until every acquisition has been matched by a release. Ownership is kept
/// in atomics so [`is_held_by_current_thread`](Self::is_held_by_current_thread)
/// and [`hold_count`](Self::hold_count) can be read from any thread. Owner
/// and count share one word, so no reader ever sees a count without an
/// owner or the reverse.
///
/// Acquisitions come in two forms: the explicit `acquire*`/[`release`](Self::release)
/// pair, and the scoped `lock*` family returning a [`SessionLockGuard`] that
/// releases on drop.
pub struct SessionLock<R: RawLock = ParkingLotRawLock> {
    raw: R,
    /// Packed owner token and hold count, see [`pack`]. Only written by the
    /// owning thread.
    state: AtomicU64,
}

impl SessionLock<ParkingLotRawLock> {
    pub fn new() -> Self {
        Self::with_raw(ParkingLotRawLock::new())
    }
}

impl Default for SessionLock<ParkingLotRawLock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawLock> SessionLock<R> {
    /// Wrap an existing primitive. The primitive must not be shared with
    /// anything else.
    pub fn with_raw(raw: R) -> Self {
        Self {
            raw,
            state: AtomicU64::new(0),
        }
    }

    /// Block until the lock is acquired.
    pub fn acquire(&self) {
        if self.reenter() {
            return;
        }
        self.raw.lock();
        self.claim();
    }

    /// Block until the lock is acquired or `cancel` fires.
    ///
    /// A cancelled attempt leaves ownership and the hold count exactly as
    /// they were.
    pub fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        if self.reenter() {
            return Ok(());
        }
        self.raw.lock_cancellable(cancel)?;
        self.claim();
        Ok(())
    }

    /// Acquire the lock only if it is free or already held by this thread.
    pub fn try_acquire(&self) -> bool {
        if self.reenter() {
            return true;
        }
        if self.raw.try_lock() {
            self.claim();
            return true;
        }
        false
    }

    /// Acquire the lock, waiting at most `timeout` for another owner to
    /// release it.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        if self.reenter() {
            return true;
        }
        if self.raw.try_lock_for(timeout) {
            self.claim();
            return true;
        }
        false
    }

    /// Undo one acquisition by the current thread.
    ///
    /// The underlying primitive is released when the hold count reaches
    /// zero. A caller that does not hold the lock gets
    /// [`LockError::NotOwner`] and nothing changes.
    pub fn release(&self) -> Result<(), LockError> {
        if !self.is_held_by_current_thread() {
            tracing::warn!(
                holds = self.hold_count(),
                "session lock released by a thread that does not own it"
            );
            return Err(LockError::NotOwner);
        }
        let (owner, holds) = unpack(self.state.load(Ordering::Relaxed));
        if holds == 1 {
            self.state.store(0, Ordering::Release);
            self.raw.unlock();
        } else {
            self.state.store(pack(owner, holds - 1), Ordering::Release);
        }
        Ok(())
    }

    /// Scoped form of [`acquire`](Self::acquire).
    pub fn lock(&self) -> SessionLockGuard<'_, R> {
        self.acquire();
        SessionLockGuard::new(self)
    }

    /// Scoped form of [`acquire_cancellable`](Self::acquire_cancellable).
    pub fn lock_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SessionLockGuard<'_, R>, LockError> {
        self.acquire_cancellable(cancel)?;
        Ok(SessionLockGuard::new(self))
    }

    /// Scoped form of [`try_acquire`](Self::try_acquire).
    pub fn try_lock(&self) -> Option<SessionLockGuard<'_, R>> {
        self.try_acquire().then(|| SessionLockGuard::new(self))
    }

    /// Scoped form of [`try_acquire_for`](Self::try_acquire_for).
    pub fn try_lock_for(&self, timeout: Duration) -> Option<SessionLockGuard<'_, R>> {
        self.try_acquire_for(timeout)
            .then(|| SessionLockGuard::new(self))
    }

    /// True iff the calling thread currently owns the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner() == current_thread_token()
    }

    /// Current reentrancy depth, 0 when nobody holds the lock.
    pub fn hold_count(&self) -> usize {
        unpack(self.state.load(Ordering::Acquire)).1 as usize
    }

    pub fn is_locked(&self) -> bool {
        self.owner() != NO_OWNER
    }

    fn owner(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// Session locks never hand out conditions; code that wants to wait on
    /// one while holding the session is structured wrong.
    pub fn new_condition(&self) -> Result<Condition, LockError> {
        Err(LockError::ConditionsUnsupported)
    }

    fn reenter(&self) -> bool {
        if !self.is_held_by_current_thread() {
            return false;
        }
        let (owner, holds) = unpack(self.state.load(Ordering::Relaxed));
        assert!(holds < u32::MAX, "session lock hold count overflow");
        self.state.store(pack(owner, holds + 1), Ordering::Release);
        true
    }

    fn claim(&self) {
        self.state
            .store(pack(current_thread_token(), 1), Ordering::Release);
    }
}

impl<R: RawLock> std::fmt::Debug for SessionLock<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (owner, holds) = unpack(self.state.load(Ordering::Acquire));
        f.debug_struct("SessionLock")
            .field("locked", &(owner != NO_OWNER))
            .field("holds", &holds)
            .finish_non_exhaustive()
    }
}

/// RAII guard for one acquisition of a [`SessionLock`].
///
/// Not `Send`: the acquisition belongs to the thread that made it.
#[must_use = "the session lock is released as soon as the guard is dropped"]
pub struct SessionLockGuard<'a, R: RawLock = ParkingLotRawLock> {
    lock: &'a SessionLock<R>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, R: RawLock> SessionLockGuard<'a, R> {
    fn new(lock: &'a SessionLock<R>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    pub fn lock(&self) -> &'a SessionLock<R> {
        self.lock
    }
}

impl<R: RawLock> Drop for SessionLockGuard<'_, R> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::error!(?e, "session lock guard dropped without ownership");
        }
    }
}
