//! Condition variables with absolute-deadline waits.
//!
//! `timed_wait` takes a deadline rather than a duration so predicate loops
//! can re-wait after spurious wakeups without stretching the total time.
//! Spurious wakeups do occur; callers always re-check their predicate.

use std::sync::Condvar;
use std::time::Instant;

use crate::error::WaitOutcome;
use crate::sync::mutex::{MutexGuard, NamedMutex};

/// Condition variable paired with a [`NamedMutex`].
#[derive(Default)]
pub struct Cond {
    inner: Condvar,
}

impl Cond {
    pub fn new() -> Self {
        Cond {
            inner: Condvar::new(),
        }
    }

    /// Atomically release the mutex and suspend until signaled or broadcast.
    /// The mutex is re-held on return; its counters are preserved.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex: &'a NamedMutex<T> = guard.mutex;
        let std_guard = self.inner.wait(guard.into_std()).unwrap();
        MutexGuard::rewrap(std_guard, mutex)
    }

    /// As [`wait`](Self::wait), but also returns when the absolute deadline
    /// expires. `None` waits forever.
    pub fn timed_wait<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, T>, WaitOutcome) {
        let mutex: &'a NamedMutex<T> = guard.mutex;
        let std_guard = guard.into_std();
        match deadline {
            None => {
                let std_guard = self.inner.wait(std_guard).unwrap();
                (MutexGuard::rewrap(std_guard, mutex), WaitOutcome::Signaled)
            }
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let (std_guard, result) = self.inner.wait_timeout(std_guard, timeout).unwrap();
                let outcome = if result.timed_out() {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Signaled
                };
                (MutexGuard::rewrap(std_guard, mutex), outcome)
            }
        }
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        self.inner.notify_one();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.inner.notify_all();
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cond")
    }
}
