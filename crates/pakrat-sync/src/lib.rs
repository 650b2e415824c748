//! # pakrat-sync
//!
//! The mutex/condition primitive everything else in the pakrat core is built
//! on: a [`Monitor`] pairs one mutual-exclusion lock with one condition
//! variable, and a [`MonitorGuard`] holds the locked state for a scope.
//!
//! ## Failure semantics
//!
//! A poisoned lock is not an error the caller can meaningfully handle here;
//! the shared state a monitor protects has no recovery story once a holder
//! panicked mid-mutation. All operations treat poisoning as a fatal process
//! fault and panic (the workspace builds with `panic = "abort"`).

use std::sync::{Condvar, Mutex, MutexGuard, TryLockError};
use std::time::Instant;

/// One mutex paired with one condition variable.
///
/// The condition variable is only ever waited on through [`Monitor::wait`] /
/// [`Monitor::wait_until`], which require the paired lock to be held, so the
/// classic lost-wakeup misuse (waiting without the lock) cannot be written
/// against this API.
pub struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) -> MonitorGuard<'_, T> {
        match self.state.lock() {
            Ok(inner) => MonitorGuard {
                owner: self,
                inner: Some(inner),
            },
            Err(_) => poisoned(),
        }
    }

    /// Acquire the lock only if it is immediately available.
    pub fn try_lock(&self) -> Option<MonitorGuard<'_, T>> {
        match self.state.try_lock() {
            Ok(inner) => Some(MonitorGuard {
                owner: self,
                inner: Some(inner),
            }),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => poisoned(),
        }
    }

    /// Block until notified. Atomically releases the lock while blocked and
    /// re-acquires it before returning.
    ///
    /// # Panics
    ///
    /// Panics if `guard` belongs to a different monitor or was already
    /// released via [`MonitorGuard::unlock`].
    pub fn wait(&self, guard: &mut MonitorGuard<'_, T>) {
        assert!(
            std::ptr::eq(self, guard.owner),
            "wait() called with a guard from a different monitor"
        );
        let held = guard.inner.take().expect("wait() on a released guard");
        match self.cond.wait(held) {
            Ok(inner) => guard.inner = Some(inner),
            Err(_) => poisoned(),
        }
    }

    /// Block until notified or until `deadline` passes. Returns `true` when
    /// the deadline was reached before any notification.
    ///
    /// # Panics
    ///
    /// Same contract as [`Monitor::wait`].
    pub fn wait_until(&self, guard: &mut MonitorGuard<'_, T>, deadline: Instant) -> bool {
        assert!(
            std::ptr::eq(self, guard.owner),
            "wait_until() called with a guard from a different monitor"
        );
        let held = guard.inner.take().expect("wait_until() on a released guard");
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.cond.wait_timeout(held, timeout) {
            Ok((inner, result)) => {
                guard.inner = Some(inner);
                result.timed_out()
            }
            Err(_) => poisoned(),
        }
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

impl<T: Default> Default for Monitor<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Monitor");
        match self.state.try_lock() {
            Ok(inner) => d.field("state", &&*inner),
            Err(_) => d.field("state", &"<locked>"),
        };
        d.finish()
    }
}

/// Scope-bound ownership of a [`Monitor`]'s locked state.
///
/// The lock is released when the guard is dropped, on every exit path, or
/// earlier via [`MonitorGuard::unlock`]. Releasing twice is a no-op.
pub struct MonitorGuard<'a, T> {
    owner: &'a Monitor<T>,
    inner: Option<MutexGuard<'a, T>>,
}

impl<T> MonitorGuard<'_, T> {
    /// Release the lock before the end of the scope. A second call, or the
    /// eventual drop, does nothing.
    pub fn unlock(&mut self) {
        self.inner = None;
    }

    /// Whether this guard still holds the lock.
    pub fn is_held(&self) -> bool {
        self.inner.is_some()
    }
}

impl<T> std::ops::Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_deref().expect("guard used after unlock()")
    }
}

impl<T> std::ops::DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_deref_mut().expect("guard used after unlock()")
    }
}

fn poisoned() -> ! {
    panic!("monitor poisoned: a thread panicked while holding the lock")
}
