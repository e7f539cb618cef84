//! Guards bind a value to a lock so that the value is only reachable
//! through a locked scope.
//!
//! Four flavors are provided:
//!
//! * [`Exclusive`] -- standard mutex semantics
//! * [`Shared`] -- read-write semantics, many readers or one writer
//! * [`Recursive`] -- re-entrant semantics with a timed acquire
//! * [`Signaled`] -- exclusive semantics plus a condition variable,
//!   for values whose consumers need to block until a predicate holds
//!
//! Each flavor offers two access modes: a scoped proxy whose lifetime
//! is the locked region, and functional access that runs a closure
//! under the lock and returns its result.
//!
//! ```
//! use encore::guard::Exclusive;
//!
//! let counter = Exclusive::new(0u32);
//!
//! *counter.lock() += 1;
//! let value = counter.with(|c| {
//!     *c += 1;
//!     *c
//! });
//!
//! assert_eq!(value, 2);
//! ```
//!
//! To enter a critical section over several guarded values without
//! risking deadlock, use [`lock_all`].

use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// The timed acquire of a [`Recursive`] guard did not obtain the lock
/// in time.
///
/// Waiting this long on a re-entrant lock almost always means two
/// threads hold each other's locks; failing the acquire lets the caller
/// surface the problem instead of hanging forever.
#[derive(Debug, Error)]
#[error("lock not acquired within {timeout:?}, a deadlock would occur")]
pub struct DeadlockWouldOccur {
    /// How long the acquire waited before giving up.
    pub timeout: Duration,
}

mod sealed {
    use parking_lot::Mutex;

    /// Access to the underlying mutex of exclusive-style guards, so
    /// that `lock_all` can drive the two-phase acquisition uniformly.
    pub trait Lockable {
        type Target;

        fn raw(&self) -> &Mutex<Self::Target>;
    }
}

use self::sealed::Lockable;

/// Guard with exclusive access to the wrapped value.
pub struct Exclusive<T> {
    value: Mutex<T>,
}

/// Scoped exclusive access to a value guarded by [`Exclusive`].
pub struct ExclusiveProxy<'a, T> {
    inner: parking_lot::MutexGuard<'a, T>,
}

impl<T> Exclusive<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Locks the guard and returns a proxy. The lock is held for the
    /// proxy's lifetime.
    pub fn lock(&self) -> ExclusiveProxy<'_, T> {
        ExclusiveProxy {
            inner: self.value.lock(),
        }
    }

    /// Runs `f` with the lock held, returning whatever `f` returns.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.value.lock())
    }

    /// Exchanges the values behind `self` and `other` without risking
    /// deadlock against a concurrent `swap` in the opposite order.
    pub fn swap(&self, other: &Self) {
        if std::ptr::eq(self, other) {
            return;
        }

        lock_all(self, other, std::mem::swap);
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T> Lockable for Exclusive<T> {
    type Target = T;

    fn raw(&self) -> &Mutex<T> {
        &self.value
    }
}

impl<'a, T> Deref for ExclusiveProxy<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<'a, T> DerefMut for ExclusiveProxy<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// Guard with exclusive write access and shared read access to the
/// wrapped value. Whether the value is borrowed mutably selects the
/// lock semantics: [`Shared::write`] excludes everyone, while any
/// number of [`Shared::read`] scopes may coexist.
pub struct Shared<T> {
    value: RwLock<T>,
}

/// Scoped write access to a value guarded by [`Shared`].
pub struct SharedWriteProxy<'a, T> {
    inner: parking_lot::RwLockWriteGuard<'a, T>,
}

/// Scoped read access to a value guarded by [`Shared`].
pub struct SharedReadProxy<'a, T> {
    inner: parking_lot::RwLockReadGuard<'a, T>,
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    /// Locks for writing; a single writer excludes all readers.
    pub fn write(&self) -> SharedWriteProxy<'_, T> {
        SharedWriteProxy {
            inner: self.value.write(),
        }
    }

    /// Locks for reading; readers share the lock with each other.
    pub fn read(&self) -> SharedReadProxy<'_, T> {
        SharedReadProxy {
            inner: self.value.read(),
        }
    }

    /// Runs `f` with the write lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.value.write())
    }

    /// Runs `f` with a read lock held.
    pub fn with_read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<'a, T> Deref for SharedWriteProxy<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<'a, T> DerefMut for SharedWriteProxy<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<'a, T> Deref for SharedReadProxy<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

/// Guard with re-entrant access to the wrapped value and a timed
/// acquire.
///
/// A thread that already holds the lock may lock again; access is
/// therefore shared (`&T`), since the same thread can observe the value
/// through several proxies at once. Acquisition waits at most the
/// configured timeout (three seconds unless overridden) before failing
/// with [`DeadlockWouldOccur`].
///
/// Reach for this only when the architecture truly demands re-entry;
/// the other flavors make the cheaper and safer default.
pub struct Recursive<T> {
    value: ReentrantMutex<T>,
    timeout: Duration,
}

/// Scoped re-entrant access to a value guarded by [`Recursive`].
pub struct RecursiveProxy<'a, T> {
    inner: parking_lot::ReentrantMutexGuard<'a, T>,
}

const RECURSIVE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

impl<T> Recursive<T> {
    pub fn new(value: T) -> Self {
        Self::with_timeout(value, RECURSIVE_ACQUIRE_TIMEOUT)
    }

    pub fn with_timeout(value: T, timeout: Duration) -> Self {
        Self {
            value: ReentrantMutex::new(value),
            timeout,
        }
    }

    /// Locks the guard, waiting at most the configured timeout.
    pub fn lock(&self) -> Result<RecursiveProxy<'_, T>, DeadlockWouldOccur> {
        match self.value.try_lock_for(self.timeout) {
            Some(inner) => Ok(RecursiveProxy { inner }),
            None => Err(DeadlockWouldOccur {
                timeout: self.timeout,
            }),
        }
    }

    /// Runs `f` with the lock held, returning whatever `f` returns.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, DeadlockWouldOccur> {
        self.lock().map(|proxy| f(&proxy))
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<'a, T> Deref for RecursiveProxy<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

/// Exclusive guard paired with a condition variable.
///
/// Consumers that need to block until the guarded value satisfies a
/// predicate lock the guard and wait through the proxy; the wait
/// releases the lock while blocked and reacquires it before the
/// predicate is re-evaluated, so the predicate always observes a
/// consistent value. Producers mutate the value and call
/// [`Signaled::notify_one`] or [`Signaled::notify_all`] -- no lock is
/// required to notify.
///
/// Waiting is only expressible through a locked proxy, which is what
/// makes the classic lost-wakeup misuse (waiting without the lock)
/// unrepresentable.
pub struct Signaled<T> {
    value: Mutex<T>,
    signal: Condvar,
}

/// Scoped exclusive access to a value guarded by [`Signaled`],
/// including the ability to wait on its condition.
pub struct SignaledProxy<'a, T> {
    inner: parking_lot::MutexGuard<'a, T>,
    signal: &'a Condvar,
}

impl<T> Signaled<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            signal: Condvar::new(),
        }
    }

    /// Locks the guard and returns a proxy. The lock is held for the
    /// proxy's lifetime.
    pub fn lock(&self) -> SignaledProxy<'_, T> {
        SignaledProxy {
            inner: self.value.lock(),
            signal: &self.signal,
        }
    }

    /// Runs `f` with the lock held, returning whatever `f` returns.
    /// `f` cannot wait; use [`Signaled::lock`] for that.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.value.lock())
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        self.signal.notify_one();
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.signal.notify_all();
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T> Lockable for Signaled<T> {
    type Target = T;

    fn raw(&self) -> &Mutex<T> {
        &self.value
    }
}

impl<'a, T> SignaledProxy<'a, T> {
    /// Blocks until `satisfied` returns true. Spurious wakeups are
    /// absorbed by re-evaluating the predicate.
    pub fn wait(&mut self, mut satisfied: impl FnMut(&T) -> bool) {
        while !satisfied(&self.inner) {
            self.signal.wait(&mut self.inner);
        }
    }

    /// Blocks until `satisfied` returns true or `timeout` elapses.
    /// Returns whether the predicate was satisfied.
    ///
    /// A timeout too large to express as a deadline on the monotonic
    /// clock degrades to an indefinite wait.
    pub fn wait_for(&mut self, timeout: Duration, satisfied: impl FnMut(&T) -> bool) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline, satisfied),
            None => {
                self.wait(satisfied);
                true
            }
        }
    }

    /// Blocks until `satisfied` returns true or `deadline` is reached.
    /// Returns whether the predicate was satisfied.
    pub fn wait_until(
        &mut self,
        deadline: Instant,
        mut satisfied: impl FnMut(&T) -> bool,
    ) -> bool {
        loop {
            if satisfied(&self.inner) {
                return true;
            }

            if self.signal.wait_until(&mut self.inner, deadline).timed_out() {
                return satisfied(&self.inner);
            }
        }
    }
}

impl<'a, T> Deref for SignaledProxy<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<'a, T> DerefMut for SignaledProxy<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// Locks two guards without risking deadlock against another thread
/// locking them in the opposite order, then runs `f` over both values.
///
/// Acquisition is two-phase: lock the first guard, try-lock the second,
/// and on failure release everything and retry starting from the other
/// side. Accepts any mix of [`Exclusive`] and [`Signaled`] guards
/// (both are write-locked).
pub fn lock_all<A, B, R>(
    a: &A,
    b: &B,
    f: impl FnOnce(&mut A::Target, &mut B::Target) -> R,
) -> R
where
    A: Lockable,
    B: Lockable,
{
    loop {
        {
            let mut first = a.raw().lock();

            if let Some(mut second) = b.raw().try_lock() {
                return f(&mut first, &mut second);
            }
        }

        {
            let mut second = b.raw().lock();

            if let Some(mut first) = a.raw().try_lock() {
                return f(&mut first, &mut second);
            }
        }

        thread::yield_now();
    }
}

/// Three-guard form of [`lock_all`].
pub fn lock_all3<A, B, C, R>(
    a: &A,
    b: &B,
    c: &C,
    f: impl FnOnce(&mut A::Target, &mut B::Target, &mut C::Target) -> R,
) -> R
where
    A: Lockable,
    B: Lockable,
    C: Lockable,
{
    loop {
        let mut first = a.raw().lock();

        if let Some(mut second) = b.raw().try_lock() {
            if let Some(mut third) = c.raw().try_lock() {
                return f(&mut first, &mut second, &mut third);
            }
        }

        drop(first);
        thread::yield_now();
    }
}
